pub mod config;
pub mod diffusion;
pub mod error;
pub mod loaders;
pub mod models;
pub mod pipeline;
pub mod sampling;

// Re-export common types
pub use config::{load_overrides, DeviceSelection, ModelConfig, NoiseSchedule};
pub use error::{EggError, Result};
pub use models::{DenoisingNetwork, NetworkProvider};
pub use pipeline::{EnergyGuidedDiffusion, DEFAULT_NUM_STEPS};
pub use sampling::{Energies, EnergyFunction, GuidedSampleIter, SampleOptions, StepOutput};

pub mod logging {
    use env_logger::{Builder, Env};
    use log::LevelFilter;
    use std::io::Write;

    /// Timestamped logger at `info`, overridable through `RUST_LOG`.
    /// Calling it twice is a no-op.
    pub fn init_logger() {
        let mut builder = Builder::new();
        builder
            .format(|buf, record| {
                writeln!(
                    buf,
                    "{} [{}] - {}",
                    chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                    record.level(),
                    record.args()
                )
            })
            .filter(None, LevelFilter::Info)
            .parse_env(Env::default());
        let _ = builder.try_init();
    }
}
