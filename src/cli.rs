use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "locf-refresh",
    version,
    about = "Gap-fill new time-series rows and refresh the continuous aggregates"
)]
pub struct Args {
    /// Process power units in batches instead of one fleet-wide pass.
    #[arg(long, default_value_t = false)]
    pub by_device: bool,
    /// Refresh every aggregate from LOCF_HISTORY_START to now, then exit.
    #[arg(long, default_value_t = false)]
    pub full_history: bool,
    /// Skip the check for another running instance.
    #[arg(long, default_value_t = false)]
    pub skip_lock: bool,
}
