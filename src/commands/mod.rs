mod config_cmd;
mod simulate;

pub use config_cmd::ConfigCommand;
pub use simulate::SimulateCommand;
