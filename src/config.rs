use std::time::Duration;

/// Tunables the spec leaves as constants-with-override. The teacher picks a
/// single default and lets callers override it (`Events::with_capacity`);
/// this groups the handful ConMgr needs into one struct.
#[derive(Debug, Clone)]
pub struct Config {
    /// Soft cap on `Connection::in_buffer` before `ReadOnly`/`ReadWrite` is
    /// dropped from the connection's next poll mode.
    pub in_buffer_soft_cap: usize,
    /// Initial capacity of the `Events` buffer the watch loop reuses across
    /// `wait` calls.
    pub events_capacity: usize,
    /// Upper bound on how long the watch loop blocks in `wait` when nothing
    /// is registered, so shutdown is noticed promptly.
    pub watch_idle_timeout: Duration,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            in_buffer_soft_cap: 1024 * 1024,
            events_capacity: 1024,
            watch_idle_timeout: Duration::from_secs(5),
        }
    }
}
