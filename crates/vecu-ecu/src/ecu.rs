//! The virtual ECU: the single instance of everything process-wide.
//!
//! One `VirtualEcu` owns the NVRAM store, the lifecycle state, the
//! application-module handle, and the OTA in-flight token. Sessions and
//! the main loop receive it as an `Arc` dependency; nothing here is a
//! true global.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{error, info, warn};
use vecu_core::nvram::NvramStore;
use vecu_core::state::{EcuState, SharedEcuState};

use crate::app::AppModule;
use crate::config::EcuConfig;

pub struct VirtualEcu {
    config: EcuConfig,
    nvram: NvramStore,
    state: SharedEcuState,
    app: AppModule,
    /// Set while some session owns the reprogramming sequence. The
    /// scratch file and the module path are process-wide, so only one
    /// OTA may be in flight at a time.
    transfer_active: AtomicBool,
}

impl VirtualEcu {
    pub fn new(config: EcuConfig) -> Self {
        let nvram = NvramStore::new(&config.nvram_file);
        let app = AppModule::new(&config.app_module);
        Self {
            config,
            nvram,
            state: SharedEcuState::default(),
            app,
            transfer_active: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &EcuConfig {
        &self.config
    }

    pub fn nvram(&self) -> &NvramStore {
        &self.nvram
    }

    pub fn state(&self) -> &SharedEcuState {
        &self.state
    }

    /// Run the boot sequence: load NVRAM and transition to APPLICATION,
    /// or to BRICKED if the store cannot be read.
    pub fn boot(&self) {
        info!("entering BOOT");
        match self.nvram.load() {
            Ok(()) => {
                info!("boot sequence complete, transitioning to APPLICATION");
                self.state.store(EcuState::Application);
            }
            Err(e) => {
                error!(error = %e, "failed to load NVRAM, entering BRICKED state");
                self.state.store(EcuState::Bricked);
            }
        }
    }

    /// Claim the single OTA in-flight token. Returns `false` when
    /// another session already owns a reprogramming sequence.
    pub fn try_begin_transfer(&self) -> bool {
        self.transfer_active
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Release the OTA token.
    pub fn end_transfer(&self) {
        self.transfer_active.store(false, Ordering::Release);
    }

    /// Hot-swap: replace the application module with the verified
    /// firmware in the scratch file and return to APPLICATION.
    ///
    /// The rename is a single atomic filesystem operation; a failure is
    /// logged but does not brick the ECU — the previous module stays in
    /// place and keeps running.
    pub fn apply_update(&self) {
        info!("applying update to application module");

        self.app.unload();

        match std::fs::rename(&self.config.update_scratch, &self.config.app_module) {
            Ok(()) => info!(
                module = %self.config.app_module.display(),
                "update applied, module will be reloaded next cycle"
            ),
            Err(e) => error!(error = %e, "failed to apply update to module"),
        }

        self.state.store(EcuState::Application);
    }

    /// One APPLICATION-state cycle: reload the module and invoke it.
    /// Load and invocation failures are transient; the next cycle
    /// retries.
    pub fn run_application_cycle(&self) {
        if let Err(e) = self.app.run_cycle() {
            warn!(error = %e, "application cycle skipped");
        }
    }

    /// Release the module handle on shutdown.
    pub fn shutdown(&self) {
        self.app.unload();
    }
}
