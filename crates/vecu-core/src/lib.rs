//! Shared building blocks for the vECU simulator.
//!
//! This crate holds everything both sides of the wire agree on: the DoIP
//! frame codec, the UDS service and data-identifier tables, the NVRAM
//! key-value store the ECU and its application share, and the ECU
//! lifecycle state. Policy (dispatch, sessions, the main loop) lives in
//! `vecu-ecu`; this crate stays mechanism-only so the tester client can
//! link it without dragging in the server.

pub mod digest;
pub mod doip;
pub mod nvram;
pub mod state;
pub mod uds;
