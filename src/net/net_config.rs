use std::time::Duration;

use anyhow::bail;


#[derive(Debug, Clone)]
pub struct NetConfig {
    /// machine name advertised in the connect greeting
    pub hostname: String,
    /// player name advertised in the connect greeting and used for session logon
    pub display_name: String,

    /// capacity of the inbound connection table; further connects are rejected
    pub max_connections: usize,
    /// upper bound on players the authority admits into one session
    pub max_players: usize,

    /// number of synchronous request slots per host
    pub max_pending_requests: usize,
    /// sleep between polls while a caller is blocked on a synchronous request
    pub request_poll_interval: Duration,
    pub default_request_timeout: Duration,

    /// ring slots per entity in the latch buffer; must be a power of two above max_lag
    pub lag_window: u32,
    /// how many ticks back the authority's rebroadcast walks
    pub max_lag: u32,

    /// payload bytes per TransferFile message; must fit the u16 length prefix
    pub max_transfer_chunk: usize,
    /// upper bound of chunks a single file may span; larger files are a caller error
    pub max_transfer_chunks: usize,
    /// how long the sender waits for a CRC reply before sending the file anyway
    pub crc_response_timeout: Duration,

    /// cadence of the per-host dispatcher loop
    pub step_interval: Duration,
}

impl NetConfig {
    pub fn new() -> NetConfig {
        NetConfig {
            hostname: "localhost".to_string(),
            display_name: "player".to_string(),
            max_connections: 8,
            max_players: 8,
            max_pending_requests: 8,
            request_poll_interval: Duration::from_millis(10),
            default_request_timeout: Duration::from_secs(2),
            lag_window: 16,
            max_lag: 8,
            max_transfer_chunk: 32 * 1024,
            max_transfer_chunks: 16,
            crc_response_timeout: Duration::from_millis(500),
            step_interval: Duration::from_millis(5),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_connections == 0 {
            bail!("connection table capacity must be positive");
        }
        if self.max_pending_requests == 0 {
            bail!("request table capacity must be positive");
        }
        if !self.lag_window.is_power_of_two() {
            bail!("lag window of {} is not a power of two", self.lag_window);
        }
        if self.max_lag == 0 || self.max_lag >= self.lag_window {
            bail!("max lag of {} does not fit the lag window of {}", self.max_lag, self.lag_window);
        }
        if self.max_transfer_chunk == 0 || self.max_transfer_chunk > u16::MAX as usize {
            bail!("transfer chunk size of {} does not fit the wire format", self.max_transfer_chunk);
        }
        Ok(())
    }
}

impl Default for NetConfig {
    fn default() -> Self {
        NetConfig::new()
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn test_default_config_is_valid() {
        assert!(NetConfig::new().validate().is_ok());
    }

    #[rstest]
    #[case::no_connections(|c: &mut NetConfig| c.max_connections = 0)]
    #[case::no_requests(|c: &mut NetConfig| c.max_pending_requests = 0)]
    #[case::ring_not_power_of_two(|c: &mut NetConfig| c.lag_window = 12)]
    #[case::lag_exceeds_window(|c: &mut NetConfig| { c.lag_window = 8; c.max_lag = 8; })]
    #[case::chunk_too_big(|c: &mut NetConfig| c.max_transfer_chunk = 100_000)]
    fn test_validate_rejects(#[case] tweak: fn(&mut NetConfig)) {
        let mut config = NetConfig::new();
        tweak(&mut config);
        assert!(config.validate().is_err());
    }
}
