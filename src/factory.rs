// SPDX-License-Identifier: GPL-3.0-only

//! Module recognition and configuration
//!
//! A camera module is an imager, an illumination driver and a storage
//! device soldered together; the storage carries an identifier naming the
//! product. Probing reads that identifier and looks it up in the table of
//! known modules to obtain the full configuration: imager family,
//! illumination limits, temperature sensor parameters, the supported use
//! cases and their processing parameters.
//!
//! A probe failure for one device must not abort enumeration; the
//! application continues probing other devices after the failure event.

use crate::errors::{CoreError, CoreResult};
use crate::events::{Event, EventSender};
use crate::pseudodata::{ImagerFamily, NtcParameters};
use crate::storage::StorageReadRandom;
use crate::storage::formats::{StorageFormatPicoLegacy, ZwetschgeReader};
use crate::usecase::{DutyCycle, UseCaseDefinition, UseCaseIdentifier};
use std::collections::HashMap;
use tracing::{info, warn};

/// Illumination driver limits of a module
#[derive(Debug, Clone, PartialEq)]
pub struct IlluminationConfig {
    pub duty_cycle: DutyCycle,
    /// Highest modulation frequency the driver may be asked for, in Hz
    pub max_modulation_frequency: u32,
}

/// Temperature sensing setup of a module
#[derive(Debug, Clone, PartialEq)]
pub struct TemperatureSensorConfig {
    pub ntc: NtcParameters,
    /// Soft alarm limit in degrees celsius
    pub soft_limit: f32,
    /// Hard alarm limit in degrees celsius
    pub hard_limit: f32,
}

/// Parameters the depth processor needs per use case; opaque to the
/// capture core
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessingParameters {
    pub values: HashMap<String, f64>,
}

/// Everything known about one module product
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleConfig {
    pub name: String,
    pub imager_family: ImagerFamily,
    pub illumination: IlluminationConfig,
    pub temperature: TemperatureSensorConfig,
    pub use_cases: Vec<UseCaseDefinition>,
    pub processing_parameters: HashMap<UseCaseIdentifier, ProcessingParameters>,
    /// In-memory copy of the calibration, when probing was asked to cache
    /// it
    pub calibration: Option<Vec<u8>>,
}

/// Storage abstraction the factory probes: who is this module, and what
/// calibration does it carry
pub trait ModuleStorage {
    fn module_identifier(&mut self) -> CoreResult<Vec<u8>>;
    fn calibration_data(&mut self) -> CoreResult<Vec<u8>>;
}

impl<S: StorageReadRandom> ModuleStorage for ZwetschgeReader<S> {
    fn module_identifier(&mut self) -> CoreResult<Vec<u8>> {
        Ok(self.table_of_contents()?.module_identifier.to_vec())
    }

    fn calibration_data(&mut self) -> CoreResult<Vec<u8>> {
        ZwetschgeReader::calibration_data(self)
    }
}

impl<S: StorageReadRandom> ModuleStorage for StorageFormatPicoLegacy<S> {
    fn module_identifier(&mut self) -> CoreResult<Vec<u8>> {
        Ok(StorageFormatPicoLegacy::module_identifier(self)?.to_vec())
    }

    fn calibration_data(&mut self) -> CoreResult<Vec<u8>> {
        StorageFormatPicoLegacy::calibration_data(self)
    }
}

/// Recognizes modules by their storage identifier
pub struct ModuleConfigFactory {
    configs: Vec<(Vec<u8>, ModuleConfig)>,
    /// Identifier to fall back to when the probed one is unknown; must
    /// name an entry of `configs` to have an effect
    default_id: Option<Vec<u8>>,
    events: EventSender,
}

impl ModuleConfigFactory {
    pub fn new(
        configs: Vec<(Vec<u8>, ModuleConfig)>,
        default_id: Option<Vec<u8>>,
        events: EventSender,
    ) -> Self {
        Self {
            configs,
            default_id,
            events,
        }
    }

    /// All module configurations this factory can produce
    pub fn enumerate_configs(&self) -> Vec<&ModuleConfig> {
        self.configs.iter().map(|(_, config)| config).collect()
    }

    fn find_config(&self, id: &[u8]) -> Option<&ModuleConfig> {
        self.configs
            .iter()
            .find(|(known, _)| known == id)
            .map(|(_, config)| config)
    }

    /// Probe the storage and build the module configuration.
    ///
    /// With `cache_calibration` the calibration blob is read during probing
    /// and stored in the returned config; this costs probe time but spares
    /// later storage I/O. A missing external configuration is reported as
    /// an event carrying the camera name and filename, and surfaces as an
    /// error so the caller can continue with other devices.
    pub fn probe_and_create(
        &self,
        camera_name: &str,
        storage: &mut dyn ModuleStorage,
        cache_calibration: bool,
    ) -> CoreResult<Option<ModuleConfig>> {
        let id = storage.module_identifier()?;

        let found = self.find_config(&id).or_else(|| {
            let default_id = self.default_id.as_ref().filter(|d| !d.is_empty())?;
            warn!(
                camera = camera_name,
                id = format!("{id:02x?}"),
                "unknown module identifier, trying the default module"
            );
            self.find_config(default_id)
        });
        let Some(config) = found else {
            warn!(camera = camera_name, id = format!("{id:02x?}"), "module not recognised");
            return Ok(None);
        };

        let mut config = config.clone();
        if cache_calibration {
            match storage.calibration_data() {
                Ok(calibration) => config.calibration = Some(calibration),
                Err(CoreError::ImagerConfigNotFound { filename }) => {
                    self.events.send(Event::ImagerConfigNotFound {
                        camera: camera_name.to_string(),
                        filename: filename.clone(),
                    });
                    return Err(CoreError::ImagerConfigNotFound { filename });
                }
                Err(e) => return Err(e),
            }
        }

        info!(camera = camera_name, module = %config.name, "module recognised");
        Ok(Some(config))
    }

    /// The default module without touching any storage; depth processing
    /// will miss its calibration, but raw capture works
    pub fn create_without_storage(&self) -> Option<ModuleConfig> {
        let default_id = self.default_id.as_ref().filter(|d| !d.is_empty())?;
        let mut config = self.find_config(default_id)?.clone();
        config.calibration = None;
        Some(config)
    }
}
