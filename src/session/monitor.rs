//! Periodic sampling of variables
//!
//! A monitored variable delivers one timestamped value every `period`
//! milliseconds instead of full buffers. Monitoring runs on the device's
//! MONITOR slot, which excludes the CONTROL slot.

use std::collections::BTreeMap;
use std::path::Path;

use tracing::{info, warn};

use super::{SessionOptions, Streamer, StreamingMode, TimestampedValues};
use crate::codec::WatcherCommand;
use crate::connection::WatcherConnection;
use crate::types::{ConnectionMode, MonitorSample};
use crate::{LinkConfig, Result, WatcherError};

/// Period used when none is given, in milliseconds.
pub const DEFAULT_PERIOD_MS: u32 = 1000;

/// Shorter periods risk flooding the channel.
const FLOOD_PERIOD_MS: u32 = 500;

#[derive(Debug)]
pub struct Monitor {
    streamer: Streamer,
}

impl Monitor {
    pub fn new(config: LinkConfig) -> Self {
        Self::from_connection(WatcherConnection::new(config, ConnectionMode::Monitor))
    }

    pub fn from_connection(conn: WatcherConnection) -> Self {
        Self { streamer: Streamer::from_connection(conn) }
    }

    /// The underlying streamer, for queue access.
    pub fn streamer(&self) -> &Streamer {
        &self.streamer
    }

    pub fn connection(&self) -> &WatcherConnection {
        self.streamer.connection()
    }

    pub async fn connect(&self) -> Result<()> {
        self.streamer.connect().await?;
        let queue_length = self.connection().config().monitor_queue_length;
        self.streamer.set_streaming_buffers_queue_length(queue_length);
        Ok(())
    }

    pub async fn disconnect(&self) {
        self.streamer.disconnect().await;
    }

    pub fn is_monitoring(&self) -> bool {
        self.streamer.is_streaming()
    }

    /// Sample `variables` (empty for all) every `periods[i]` ms until stopped.
    pub async fn start_monitoring<S: AsRef<str>>(
        &self,
        variables: &[S],
        periods: &[u32],
        options: SessionOptions,
    ) -> Result<()> {
        let vars = self.connection().check_vars(variables)?;
        let periods = check_periods(periods, vars.len())?;
        let started = self.streamer.begin(&vars, StreamingMode::Forever, None, options).await?;
        self.streamer.send_or_abort([monitor_command(&started.vars, &periods)]).await?;
        info!(variables = ?started.vars, ?periods, "Started monitoring");
        Ok(())
    }

    /// Stop monitoring `variables` (empty for all) and return the samples
    /// of every variable that produced any.
    pub async fn stop_monitoring<S: AsRef<str>>(
        &self,
        variables: &[S],
    ) -> Result<BTreeMap<String, TimestampedValues>> {
        self.streamer.stop_streaming(variables).await?;
        Ok(self.values().into_iter().filter(|(_, values)| !values.is_empty()).collect())
    }

    /// Sample until every variable has produced `n_values` samples.
    pub async fn monitor_n_values<S: AsRef<str>>(
        &self,
        variables: &[S],
        periods: &[u32],
        n_values: usize,
        options: SessionOptions,
    ) -> Result<BTreeMap<String, TimestampedValues>> {
        let vars = self.connection().check_vars(variables)?;
        let periods = check_periods(periods, vars.len())?;
        let started =
            self.streamer.begin(&vars, StreamingMode::NValues, Some(n_values), options).await?;
        self.streamer.send_or_abort([monitor_command(&started.vars, &periods)]).await?;
        info!(variables = ?started.vars, ?periods, n_values, "Monitoring values");
        self.streamer.await_completion(started.done).await?;
        self.streamer.stop_streaming(&started.vars).await?;
        Ok(self.values())
    }

    /// One current sample of each of `variables` (empty for all).
    ///
    /// Gives up after the configured response timeout.
    pub async fn peek<S: AsRef<str>>(
        &self,
        variables: &[S],
    ) -> Result<BTreeMap<String, MonitorSample>> {
        let options = SessionOptions::default();
        let started = self.streamer.begin(variables, StreamingMode::Peek, None, options).await?;
        let periods = vec![1; started.vars.len()];
        self.streamer.send_or_abort([monitor_command(&started.vars, &periods)]).await?;

        let timeout = self.connection().config().response_timeout();
        let completion = self.streamer.await_completion(started.done);
        let outcome = tokio::time::timeout(timeout, completion).await;
        let peeked = self.streamer.take_peeked();
        self.streamer.stop_streaming(&started.vars).await?;
        match outcome {
            Ok(result) => result.map(|()| peeked),
            Err(_) => Err(WatcherError::timeout("peek", timeout)),
        }
    }

    /// Queued samples per variable.
    pub fn values(&self) -> BTreeMap<String, TimestampedValues> {
        self.streamer
            .streaming_buffers_queue()
            .into_iter()
            .map(|(name, buffers)| {
                let mut values = TimestampedValues::default();
                for buffer in &buffers {
                    values.extend_from_buffer(buffer);
                }
                (name, values)
            })
            .collect()
    }

    /// Read back a monitor saving file as one flat series.
    pub fn load_data_from_file<P: AsRef<Path>>(&self, path: P) -> Result<TimestampedValues> {
        let mut values = TimestampedValues::default();
        for buffer in self.streamer.load_data_from_file(path)? {
            values.extend_from_buffer(&buffer);
        }
        Ok(values)
    }
}

/// Validate monitoring periods for `n_vars` variables.
///
/// An empty list means [`DEFAULT_PERIOD_MS`] for every variable.
pub fn check_periods(periods: &[u32], n_vars: usize) -> Result<Vec<u32>> {
    if periods.is_empty() {
        warn!(period = DEFAULT_PERIOD_MS, "No periods passed, using the default");
        return Ok(vec![DEFAULT_PERIOD_MS; n_vars]);
    }
    if periods.len() != n_vars {
        return Err(WatcherError::invalid_argument(format!(
            "{} periods given for {} variables",
            periods.len(),
            n_vars
        )));
    }
    if periods.iter().any(|&p| p > 1 && p < FLOOD_PERIOD_MS) {
        warn!(
            ?periods,
            "Periods under {FLOOD_PERIOD_MS} ms send messages very frequently, \
             use streaming instead"
        );
    }
    Ok(periods.to_vec())
}

fn monitor_command(vars: &[String], periods: &[u32]) -> WatcherCommand {
    WatcherCommand::Monitor { watchers: vars.to_vec(), periods: periods.to_vec() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn periods_default_and_must_match_variables() {
        assert_eq!(check_periods(&[], 3).unwrap(), vec![1000, 1000, 1000]);
        assert_eq!(check_periods(&[1, 250], 2).unwrap(), vec![1, 250]);
        assert!(matches!(check_periods(&[1000], 2), Err(WatcherError::InvalidArgument { .. })));
    }
}
