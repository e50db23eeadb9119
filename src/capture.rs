// SPDX-License-Identifier: GPL-3.0-only

//! Capture coordinator
//!
//! Ties one imager, one bridge and one frame collector into a working
//! pipeline. The coordinator owns all three, so neither the bridge nor the
//! collector ever holds a reference back into the control path; the
//! collector only keeps the buffer-pool handle it needs to return buffers.
//!
//! Imager variant and bridge transport are chosen when the coordinator is
//! built; afterwards every call goes through the same concrete pipeline.

use crate::bridge::acquisition::{BridgeDataReceiver, DataSource};
use crate::collector::{FrameCollector, FrameGroupListener};
use crate::config::CaptureConfig;
use crate::errors::{CoreError, CoreResult};
use crate::events::EventSender;
use crate::factory::ModuleConfig;
use crate::imager::Imager;
use crate::monitor::TemperatureMonitor;
use crate::usecase::{UseCaseDefinition, VerificationStatus};
use std::sync::Arc;
use tracing::info;

/// A probed camera module wired into a capture pipeline
pub struct CaptureDevice<S> {
    imager: Box<dyn Imager>,
    receiver: BridgeDataReceiver<S>,
    collector: Arc<FrameCollector>,
    module: ModuleConfig,
    config: CaptureConfig,
    executing: Option<UseCaseDefinition>,
}

impl<S: DataSource> CaptureDevice<S> {
    pub fn new(
        imager: Box<dyn Imager>,
        receiver: BridgeDataReceiver<S>,
        module: ModuleConfig,
        config: CaptureConfig,
        events: EventSender,
    ) -> CoreResult<Self> {
        let collector = Arc::new(FrameCollector::new(
            imager.create_pseudodata_interpreter(),
            receiver.pool(),
            receiver.stats(),
            events.clone(),
            config.stats_interval,
        ));

        let monitor = Arc::new(TemperatureMonitor::new(
            module.temperature.soft_limit,
            module.temperature.hard_limit,
            events,
        )?);
        collector.set_temperature_monitor(module.temperature.ntc, monitor);

        Ok(Self {
            imager,
            receiver,
            collector,
            module,
            config,
            executing: None,
        })
    }

    pub fn module(&self) -> &ModuleConfig {
        &self.module
    }

    /// The use cases this module supports
    pub fn use_cases(&self) -> &[UseCaseDefinition] {
        &self.module.use_cases
    }

    /// Bring the imager up; must be called once before anything else
    pub fn initialize(&mut self) -> CoreResult<()> {
        self.imager.initialize()?;
        info!(serial = %self.imager.serial_number()?, "capture device initialized");
        Ok(())
    }

    /// Configure the whole pipeline for a use case: imager registers,
    /// buffer pool geometry and collector streams
    pub fn execute_use_case(&mut self, use_case: &UseCaseDefinition) -> CoreResult<()> {
        let status = self.imager.verify_use_case(use_case);
        if status != VerificationStatus::Success {
            return Err(CoreError::InvalidValue(format!(
                "use case {} failed verification: {status:?}",
                use_case.name
            )));
        }

        self.imager.execute_use_case(use_case)?;

        // superframe families deliver the whole sequence per buffer
        let frames_per_buffer = self
            .imager
            .measurement_block_sizes()
            .into_iter()
            .max()
            .unwrap_or(1);
        let wanted = self
            .config
            .preferred_buffer_count
            .max(FrameCollector::buffer_reservation(use_case));
        self.receiver
            .execute_use_case(use_case.width, use_case.height, frames_per_buffer, wanted)?;

        self.collector.execute_use_case(use_case)?;
        self.receiver
            .set_capture_listener(Some(Arc::clone(&self.collector) as _));
        self.executing = Some(use_case.clone());
        Ok(())
    }

    /// Frame groups go to this listener from here on
    pub fn set_frame_group_listener(&self, listener: Option<Arc<dyn FrameGroupListener>>) {
        self.collector.set_frame_group_listener(listener);
    }

    pub fn start_capture(&mut self) -> CoreResult<()> {
        if self.executing.is_none() {
            return Err(CoreError::WrongState(
                "no use case has been executed".to_string(),
            ));
        }
        self.imager.start_capture()?;
        self.receiver.start_capture()
    }

    pub fn stop_capture(&mut self) -> CoreResult<()> {
        self.imager.stop_capture()?;
        self.receiver.stop_capture();
        self.collector.flush_statistics();
        Ok(())
    }

    /// Change exposures while capturing; see
    /// [`Imager::reconfigure_exposure_times`] for the counter semantics
    pub fn reconfigure_exposure_times(&mut self, exposure_times: &[u32]) -> CoreResult<u16> {
        self.imager.reconfigure_exposure_times(exposure_times)
    }

    pub fn reconfigure_target_frame_rate(&mut self, frame_rate: u16) -> CoreResult<u16> {
        self.imager.reconfigure_target_frame_rate(frame_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::BufferDataFormat;
    use crate::events::EventQueue;
    use crate::factory::{IlluminationConfig, TemperatureSensorConfig};
    use crate::imager::ImagerState;
    use crate::imager::software_defined::SoftwareDefinedImager;
    use crate::pseudodata::{ImagerFamily, NtcParameters};
    use crate::registers::RegisterAccess;
    use crate::registers::mock::MockRegisterIo;
    use crate::usecase::{DutyCycle, four_phase_plus_gray};
    use std::collections::HashMap;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    struct SilentSource {
        payloads: Mutex<VecDeque<Vec<u8>>>,
    }

    impl DataSource for SilentSource {
        fn receive_payload(&mut self, timeout: Duration) -> CoreResult<Option<Vec<u8>>> {
            let next = self
                .payloads
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pop_front();
            if next.is_none() {
                std::thread::sleep(timeout.min(Duration::from_millis(2)));
            }
            Ok(next)
        }
    }

    fn test_use_case() -> UseCaseDefinition {
        four_phase_plus_gray("MODE_9_5FPS", 5.0, 176, 120, 80_000_000, 1000)
    }

    fn module() -> ModuleConfig {
        ModuleConfig {
            name: "test-module".to_string(),
            imager_family: ImagerFamily::Aura100,
            illumination: IlluminationConfig {
                duty_cycle: DutyCycle::Dc50,
                max_modulation_frequency: 100_000_000,
            },
            temperature: TemperatureSensorConfig {
                ntc: NtcParameters::default(),
                soft_limit: 60.0,
                hard_limit: 65.0,
            },
            use_cases: vec![test_use_case()],
            processing_parameters: HashMap::new(),
            calibration: None,
        }
    }

    fn device(queue: &EventQueue) -> CaptureDevice<SilentSource> {
        let io = MockRegisterIo::default().with_register(0xA0A5, 0x0A12);
        let imager = SoftwareDefinedImager::new(RegisterAccess::new(io), vec![]);
        let receiver = BridgeDataReceiver::new(
            SilentSource {
                payloads: Mutex::new(VecDeque::new()),
            },
            BufferDataFormat::Raw16,
        );
        CaptureDevice::new(
            Box::new(imager),
            receiver,
            module(),
            CaptureConfig::default(),
            queue.sender(),
        )
        .expect("device")
    }

    #[test]
    fn test_lifecycle_through_the_coordinator() {
        let queue = EventQueue::new();
        let mut device = device(&queue);

        device.initialize().expect("initialize");
        device.execute_use_case(&test_use_case()).expect("execute");
        device.start_capture().expect("start");
        // a reconfiguration is only legal while capturing
        device
            .reconfigure_exposure_times(&[1200, 300])
            .expect("reconfigure");
        device.stop_capture().expect("stop");
    }

    #[test]
    fn test_start_before_execute_is_rejected() {
        let queue = EventQueue::new();
        let mut device = device(&queue);
        device.initialize().expect("initialize");
        assert!(matches!(
            device.start_capture(),
            Err(CoreError::WrongState(_))
        ));
    }

    #[test]
    fn test_execute_rejects_unverifiable_use_case() {
        let queue = EventQueue::new();
        let mut device = device(&queue);
        device.initialize().expect("initialize");
        let mut bad = test_use_case();
        bad.target_rate = 0.0;
        assert!(matches!(
            device.execute_use_case(&bad),
            Err(CoreError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_imager_state_is_visible() {
        let queue = EventQueue::new();
        let mut device = device(&queue);
        assert_eq!(device.imager.state(), ImagerState::Virgin);
        device.initialize().expect("initialize");
        assert_eq!(device.imager.state(), ImagerState::Ready);
    }
}
