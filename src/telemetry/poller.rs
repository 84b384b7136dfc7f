use std::{collections::BTreeMap, time::Duration};

use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace, trace_span};

use crate::{
    app_config::AppConfig,
    attribute_client::{AttributeClient, ControlError},
    clock_controller::ClockController,
    device::Device,
    gpu_data::ClockFreqs,
    protocol::{Attribute, TargetKind},
    telemetry::{MetricChannel, ring_series::RingBufferSeries},
};

// Periodic sampler of one GPU. Each tick appends one value to the series
// of every subscribed channel
pub struct TelemetryPoller<'a> {
    client: &'a AttributeClient,
    device: Device,

    interval: Duration,
    capacity: usize,

    // Series of the subscribed channels only
    channels: BTreeMap<MetricChannel, RingBufferSeries>,
}

impl<'a> TelemetryPoller<'a> {
    pub fn new(
        client: &'a AttributeClient,
        device: Device,
        config: &AppConfig,
    ) -> Self {
        Self {
            client,
            device,

            interval: config.poll_interval,
            capacity: config.history_capacity,

            channels: BTreeMap::new(),
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    // Start sampling the channel, subscribing twice keeps the existing history
    pub fn subscribe(&mut self, channel: MetricChannel) {
        let capacity = self.capacity;

        self.channels
            .entry(channel)
            .or_insert_with(|| RingBufferSeries::new(capacity));
    }

    pub fn unsubscribe(&mut self, channel: MetricChannel) {
        self.channels.remove(&channel);
    }

    pub fn is_active(&self) -> bool {
        !self.channels.is_empty()
    }

    pub fn series(&self, channel: MetricChannel) -> Option<&RingBufferSeries> {
        self.channels.get(&channel)
    }

    // Latest value of every subscribed channel
    pub fn latest_values(&self) -> Vec<(MetricChannel, i32)> {
        self.channels
            .iter()
            .filter_map(|(channel, series)| {
                series.latest().map(|value| (*channel, value))
            })
            .collect()
    }

    // Sample every subscribed channel once. Nothing is appended if any
    // read fails
    pub fn tick(&mut self) -> Result<(), ControlError> {
        let _span =
            trace_span!("telemetry tick", gpu = self.device.id).entered();

        let clocks = if self.channels.keys().any(|c| c.needs_clock_read()) {
            ClockController::new(self.client)
                .get_current_clocks(&self.device)?
        } else {
            ClockFreqs::default()
        };

        let mut samples = Vec::with_capacity(self.channels.len());

        for channel in self.channels.keys() {
            let value = match channel {
                MetricChannel::Temperature => {
                    ClockController::new(self.client)
                        .get_core_temperature(&self.device)?
                }
                MetricChannel::CoreClock => clocks.core,
                MetricChannel::MemClock => clocks.mem,
                MetricChannel::FanSpeed => self.client.get_int(
                    &self.device,
                    TargetKind::Cooler,
                    Attribute::CoolerCurrentLevel,
                )?,
            };

            samples.push((*channel, value));
        }

        for (channel, value) in samples {
            if let Some(series) = self.channels.get_mut(&channel) {
                series.append(value);
            }
        }

        trace!("GPU {}: sampled {:?}", self.device.id, self.latest_values());

        Ok(())
    }

    // Sample on every interval until the token is cancelled. Failed
    // samples are logged and the loop keeps going
    pub async fn run(
        &mut self,
        run_token: CancellationToken,
        mut on_tick: impl FnMut(&Self),
    ) {
        info!("Telemetry poller: Running on GPU {}", self.device.id);

        loop {
            select! {
                _ = run_token.cancelled() => {
                    info!("Telemetry poller: Quiting");
                    break;
                },
                _ = tokio::time::sleep(self.interval) => {
                    if !self.is_active() {
                        continue;
                    }

                    match self.tick() {
                        Ok(()) => on_tick(self),
                        Err(err) => error!("Telemetry poller: {err}"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::protocol::simulated::SimulatedProtocol;

    fn setup() -> (AttributeClient, Rc<SimulatedProtocol>, Device) {
        let protocol = Rc::new(SimulatedProtocol::with_gpu_count(1));
        let client = AttributeClient::new(Box::new(protocol.clone()));
        let device = client.enumerate_devices().unwrap().remove(0);

        (client, protocol, device)
    }

    #[test]
    fn tick_samples_only_subscribed_channels() {
        let (client, protocol, device) = setup();
        let mut poller =
            TelemetryPoller::new(&client, device, &AppConfig::default());

        poller.subscribe(MetricChannel::Temperature);

        // A failing clock read must not matter without a clock channel
        protocol.fail_attribute(Attribute::CurrentClockFreqs);
        poller.tick().unwrap();

        assert_eq!(
            poller.series(MetricChannel::Temperature).map(|s| s.to_vec()),
            Some(vec![45])
        );
        assert!(poller.series(MetricChannel::CoreClock).is_none());
    }

    #[test]
    fn clocks_are_split_into_two_channels() {
        let (client, _, device) = setup();
        let mut poller =
            TelemetryPoller::new(&client, device, &AppConfig::default());

        for channel in MetricChannel::ALL {
            poller.subscribe(channel);
        }
        poller.tick().unwrap();

        assert_eq!(
            poller.latest_values(),
            vec![
                (MetricChannel::Temperature, 45),
                (MetricChannel::CoreClock, 1607),
                (MetricChannel::MemClock, 5005),
                (MetricChannel::FanSpeed, 33),
            ]
        );
    }

    #[test]
    fn unsubscribed_channel_drops_its_history() {
        let (client, protocol, device) = setup();
        let mut poller =
            TelemetryPoller::new(&client, device, &AppConfig::default());
        poller.subscribe(MetricChannel::Temperature);
        poller.subscribe(MetricChannel::FanSpeed);
        poller.tick().unwrap();

        poller.unsubscribe(MetricChannel::FanSpeed);
        // The fan is no longer read once unsubscribed
        protocol.fail_attribute(Attribute::CoolerCurrentLevel);
        poller.tick().unwrap();

        assert!(poller.series(MetricChannel::FanSpeed).is_none());
        assert_eq!(
            poller.series(MetricChannel::Temperature).map(|s| s.len()),
            Some(2)
        );
        assert!(poller.is_active());

        // Subscribing twice keeps the history
        poller.subscribe(MetricChannel::Temperature);
        assert_eq!(
            poller.series(MetricChannel::Temperature).map(|s| s.len()),
            Some(2)
        );

        poller.unsubscribe(MetricChannel::Temperature);
        assert!(!poller.is_active());
        assert!(poller.latest_values().is_empty());
    }

    #[test]
    fn failed_read_appends_nothing() {
        let (client, protocol, device) = setup();
        let mut poller =
            TelemetryPoller::new(&client, device, &AppConfig::default());
        poller.subscribe(MetricChannel::Temperature);
        poller.subscribe(MetricChannel::FanSpeed);

        protocol.fail_attribute(Attribute::CoolerCurrentLevel);
        assert!(poller.tick().is_err());

        assert_eq!(
            poller.series(MetricChannel::Temperature).map(|s| s.len()),
            Some(0)
        );
    }

    #[test]
    fn history_is_bounded_by_capacity() {
        let (client, _, device) = setup();
        let config = AppConfig {
            history_capacity: 3,
            ..AppConfig::default()
        };
        let mut poller = TelemetryPoller::new(&client, device, &config);
        poller.subscribe(MetricChannel::FanSpeed);

        for _ in 0..5 {
            poller.tick().unwrap();
        }

        let series = poller.series(MetricChannel::FanSpeed).unwrap();
        assert_eq!(series.len(), 3);
        assert_eq!(series.display_offset(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn run_samples_every_interval_until_cancelled() {
        let (client, protocol, device) = setup();
        let mut poller =
            TelemetryPoller::new(&client, device, &AppConfig::default());
        poller.subscribe(MetricChannel::Temperature);

        let token = CancellationToken::new();
        let stop = {
            let token = token.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(3500)).await;
                token.cancel();
            }
        };

        let mut ticks = 0;
        tokio::join!(poller.run(token, |_| ticks += 1), stop);

        assert_eq!(ticks, 3);
        assert_eq!(
            poller.series(MetricChannel::Temperature).map(|s| s.len()),
            Some(3)
        );
        assert!(protocol.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn run_survives_failed_samples() {
        let (client, protocol, device) = setup();
        let mut poller =
            TelemetryPoller::new(&client, device, &AppConfig::default());
        poller.subscribe(MetricChannel::Temperature);
        protocol.fail_attribute(Attribute::CoreTemperature);

        let token = CancellationToken::new();
        let stop = {
            let token = token.clone();
            let protocol = protocol.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(2500)).await;
                protocol.restore_attribute(Attribute::CoreTemperature);
                tokio::time::sleep(Duration::from_secs(2)).await;
                token.cancel();
            }
        };

        let mut ticks = 0;
        tokio::join!(poller.run(token, |_| ticks += 1), stop);

        // Ticks at 1s and 2s failed, 3s and 4s succeeded
        assert_eq!(ticks, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_without_subscribers() {
        let (client, protocol, device) = setup();
        let mut poller =
            TelemetryPoller::new(&client, device, &AppConfig::default());
        protocol.fail_attribute(Attribute::CoreTemperature);

        let token = CancellationToken::new();
        let stop = {
            let token = token.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(2500)).await;
                token.cancel();
            }
        };

        let mut ticks = 0;
        tokio::join!(poller.run(token, |_| ticks += 1), stop);

        assert_eq!(ticks, 0);
        assert!(!poller.is_active());
    }
}
