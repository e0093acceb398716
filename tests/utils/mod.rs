use log::LevelFilter;
use simplelog::{CombinedLogger, SimpleLogger};
use std::sync::Once;

static INIT_LOG: Once = Once::new();

#[allow(dead_code)] // Only used in tests
pub fn init_log() {
    INIT_LOG.call_once(|| {
        CombinedLogger::init(vec![SimpleLogger::new(
            LevelFilter::Info,
            simplelog::Config::default(),
        )])
        .unwrap()
    });
}
