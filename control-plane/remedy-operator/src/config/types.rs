use envconfig::Envconfig;

#[derive(Envconfig, Clone, Debug)]
pub struct RemedyConfig {
    #[envconfig(from = "REMEDY_HTTP_PORT", default = "8088")]
    pub http_port: u16,

    /// Parallel reconciliation workers draining the shared queue.
    #[envconfig(from = "REMEDY_WORKERS", default = "2")]
    pub workers: usize,

    /// First backoff step after a transient failure.
    #[envconfig(from = "REMEDY_BACKOFF_BASE_MS", default = "1000")]
    pub backoff_base_ms: u64,

    /// Ceiling for the exponential backoff.
    #[envconfig(from = "REMEDY_BACKOFF_CAP_SECS", default = "300")]
    pub backoff_cap_secs: u64,

    /// Optimistic-concurrency retries per status commit.
    #[envconfig(from = "REMEDY_STATUS_RETRIES", default = "3")]
    pub status_retries: u32,
}

impl RemedyConfig {
    /// Clamp values that would wedge the control loop.
    pub fn normalized(mut self) -> Self {
        if self.workers == 0 {
            self.workers = 1;
        }
        if self.backoff_base_ms == 0 {
            self.backoff_base_ms = 100;
        }
        self
    }
}
