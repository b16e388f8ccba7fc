//! Experiment parameters and Micro-Manager stage position lists.

use log::info;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ExperimentError;
use crate::prior::protocol::TTL_PIN_COUNT;
use crate::trigger::{LightSourceTrigger, TriggerSequence};
use crate::types::Position;

fn default_num_images() -> u32 {
    1
}

fn default_delay_s() -> f64 {
    240.0
}

/// The experiment parameter document (`params.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentParams {
    #[serde(default = "default_num_images")]
    pub num_images: u32,
    #[serde(default = "default_delay_s")]
    pub delay_s: f64,
    #[serde(default)]
    pub data_folder: PathBuf,
    /// One single-key object per trigger, in firing order.
    pub triggers: Vec<BTreeMap<String, TriggerParams>>,
    /// Micro-Manager position list; relative paths resolve against the
    /// parameter file's folder.
    pub stage_positions: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerParams {
    pub ttl_pin: Option<u8>,
    pub exposure_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TriggerSpec {
    pub name: String,
    pub ttl_pin: Option<u8>,
    pub exposure: Option<Duration>,
}

/// Validated experiment, built once before the run.
#[derive(Debug, Clone)]
pub struct ExperimentConfig {
    pub target_rounds: u32,
    pub delay: Duration,
    pub data_folder: PathBuf,
    pub triggers: Vec<TriggerSpec>,
    pub positions: Vec<Position>,
}

impl ExperimentConfig {
    /// Read `params_path` and the position list it names.
    pub fn load(params_path: &Path, z_scale: f64) -> Result<Self, ExperimentError> {
        info!("Reading experiment configuration file...");
        let params: ExperimentParams = read_json(params_path)?;

        let base = params_path.parent().unwrap_or(Path::new(""));
        let positions_path = if params.stage_positions.is_absolute() {
            params.stage_positions.clone()
        } else {
            base.join(&params.stage_positions)
        };

        info!("Configuring stage positions...");
        let positions = read_stage_positions(&positions_path, z_scale)?;
        Self::from_params(params, positions)
    }

    pub fn from_params(
        params: ExperimentParams,
        positions: Vec<Position>,
    ) -> Result<Self, ExperimentError> {
        let delay = Duration::try_from_secs_f64(params.delay_s).map_err(|e| {
            ExperimentError::Invalid(format!("delay_s = {}: {}", params.delay_s, e))
        })?;
        if positions.is_empty() {
            return Err(ExperimentError::Invalid(
                "stage position list is empty".to_string(),
            ));
        }
        if params.triggers.is_empty() {
            return Err(ExperimentError::Invalid("no triggers configured".to_string()));
        }

        info!("Configuring triggers...");
        let mut triggers = Vec::with_capacity(params.triggers.len());
        for entry in params.triggers {
            if entry.len() != 1 {
                return Err(ExperimentError::Invalid(format!(
                    "each trigger must be a single-key object, got {} keys",
                    entry.len()
                )));
            }
            for (name, trigger) in entry {
                if let Some(pin) = trigger.ttl_pin {
                    if pin >= TTL_PIN_COUNT {
                        return Err(ExperimentError::Invalid(format!(
                            "trigger {name}: TTL pin {pin} out of range 0..{TTL_PIN_COUNT}"
                        )));
                    }
                }
                info!("Adding trigger: {}", name);
                triggers.push(TriggerSpec {
                    name,
                    ttl_pin: trigger.ttl_pin,
                    exposure: trigger.exposure_ms.map(Duration::from_millis),
                });
            }
        }

        Ok(Self {
            target_rounds: params.num_images,
            delay,
            data_folder: params.data_folder,
            triggers,
            positions,
        })
    }

    pub fn build_triggers(&self) -> TriggerSequence {
        let mut sequence = TriggerSequence::default();
        for spec in &self.triggers {
            sequence.push(LightSourceTrigger::new(
                spec.name.clone(),
                spec.ttl_pin,
                spec.exposure,
            ));
        }
        sequence
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ExperimentError> {
    let content = fs::read_to_string(path).map_err(|source| ExperimentError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| ExperimentError::Json {
        path: path.to_path_buf(),
        source,
    })
}

// Micro-Manager position list layout
#[derive(Deserialize)]
struct PositionList {
    map: PositionMap,
}

#[derive(Deserialize)]
struct PositionMap {
    #[serde(rename = "StagePositions")]
    stage_positions: PropertyArray<StagePosition>,
}

#[derive(Deserialize)]
struct PropertyArray<T> {
    array: Vec<T>,
}

#[derive(Deserialize)]
struct StagePosition {
    #[serde(rename = "DevicePositions")]
    device_positions: PropertyArray<DevicePosition>,
}

#[derive(Deserialize)]
struct DevicePosition {
    #[serde(rename = "Device")]
    device: Scalar,
    #[serde(rename = "Position_um")]
    position_um: PropertyArray<f64>,
}

#[derive(Deserialize)]
struct Scalar {
    scalar: String,
}

pub fn read_stage_positions(path: &Path, z_scale: f64) -> Result<Vec<Position>, ExperimentError> {
    let list: PositionList = read_json(path)?;
    convert_positions(list, z_scale)
}

/// Parse a Micro-Manager position list. X and Y come from `XYStage`, Z from
/// `ZStage` multiplied by `z_scale`; all three are truncated.
pub fn parse_stage_positions(json: &str, z_scale: f64) -> Result<Vec<Position>, ExperimentError> {
    let list: PositionList = serde_json::from_str(json).map_err(|source| ExperimentError::Json {
        path: PathBuf::from("<inline>"),
        source,
    })?;
    convert_positions(list, z_scale)
}

fn convert_positions(list: PositionList, z_scale: f64) -> Result<Vec<Position>, ExperimentError> {
    list.map
        .stage_positions
        .array
        .into_iter()
        .enumerate()
        .map(|(index, stage_position)| {
            let devices: BTreeMap<String, Vec<f64>> = stage_position
                .device_positions
                .array
                .into_iter()
                .map(|d| (d.device.scalar, d.position_um.array))
                .collect();

            let xy = devices.get("XYStage").filter(|v| v.len() >= 2);
            let z = devices.get("ZStage").and_then(|v| v.first());
            match (xy, z) {
                (Some(xy), Some(z)) => Ok(Position::new(
                    xy[0] as i64,
                    xy[1] as i64,
                    (z * z_scale) as i64,
                )),
                _ => Err(ExperimentError::Invalid(format!(
                    "position {index} needs XYStage and ZStage coordinates"
                ))),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const POSITIONS: &str = r#"{
        "format": "Micro-Manager Property Map",
        "map": {
            "StagePositions": {
                "type": "PROPERTY_MAP",
                "array": [
                    {
                        "DevicePositions": {
                            "type": "PROPERTY_MAP",
                            "array": [
                                {
                                    "Device": { "type": "STRING", "scalar": "ZStage" },
                                    "Position_um": { "type": "DOUBLE", "array": [ 1234.56 ] }
                                },
                                {
                                    "Device": { "type": "STRING", "scalar": "XYStage" },
                                    "Position_um": { "type": "DOUBLE", "array": [ 10500.9, -2000.2 ] }
                                }
                            ]
                        },
                        "Label": { "type": "STRING", "scalar": "Pos0" }
                    },
                    {
                        "DevicePositions": {
                            "type": "PROPERTY_MAP",
                            "array": [
                                {
                                    "Device": { "type": "STRING", "scalar": "XYStage" },
                                    "Position_um": { "type": "DOUBLE", "array": [ 0.0, 350.0 ] }
                                },
                                {
                                    "Device": { "type": "STRING", "scalar": "ZStage" },
                                    "Position_um": { "type": "DOUBLE", "array": [ 12.34 ] }
                                }
                            ]
                        }
                    }
                ]
            }
        }
    }"#;

    #[test]
    fn test_parse_micromanager_positions() {
        let positions = parse_stage_positions(POSITIONS, 10.0).unwrap();
        assert_eq!(
            positions,
            vec![
                Position::new(10500, -2000, 12345),
                Position::new(0, 350, 123)
            ]
        );
    }

    #[test]
    fn test_position_without_z_rejected() {
        let json = r#"{"map":{"StagePositions":{"array":[{"DevicePositions":{"array":[
            {"Device":{"scalar":"XYStage"},"Position_um":{"array":[1.0,2.0]}}
        ]}}]}}}"#;
        assert!(matches!(
            parse_stage_positions(json, 10.0),
            Err(ExperimentError::Invalid(_))
        ));
    }

    #[test]
    fn test_params_defaults() {
        let params: ExperimentParams = serde_json::from_str(
            r#"{ "triggers": [ { "brightfield": {} } ], "stage_positions": "positions.pos" }"#,
        )
        .unwrap();
        assert_eq!(params.num_images, 1);
        assert_eq!(params.delay_s, 240.0);
        assert_eq!(params.data_folder, PathBuf::new());
    }

    #[test]
    fn test_load_resolves_positions_next_to_params() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("positions.pos"), POSITIONS).unwrap();
        fs::write(
            dir.path().join("params.json"),
            r#"{
                "num_images": 500,
                "delay_s": 120,
                "data_folder": "/data/run1",
                "triggers": [
                    { "brightfield": { "exposure_ms": 20 } },
                    { "GFP": { "ttl_pin": 1, "exposure_ms": 150 } }
                ],
                "stage_positions": "positions.pos"
            }"#,
        )
        .unwrap();

        let config = ExperimentConfig::load(&dir.path().join("params.json"), 10.0).unwrap();

        assert_eq!(config.target_rounds, 500);
        assert_eq!(config.delay, Duration::from_secs(120));
        assert_eq!(config.data_folder, PathBuf::from("/data/run1"));
        assert_eq!(config.positions.len(), 2);
        assert_eq!(
            config.triggers[1],
            TriggerSpec {
                name: "GFP".to_string(),
                ttl_pin: Some(1),
                exposure: Some(Duration::from_millis(150)),
            }
        );
        assert_eq!(config.build_triggers().names(), vec!["brightfield", "GFP"]);
    }

    #[test]
    fn test_invalid_experiments() {
        let params = |triggers: &str, delay: f64| ExperimentParams {
            num_images: 1,
            delay_s: delay,
            data_folder: PathBuf::from("data"),
            triggers: serde_json::from_str(triggers).unwrap(),
            stage_positions: PathBuf::from("positions.pos"),
        };
        let one = vec![Position::new(0, 0, 0)];

        assert!(ExperimentConfig::from_params(params(r#"[{"a":{}}]"#, 1.0), one.clone()).is_ok());
        assert!(ExperimentConfig::from_params(params(r#"[]"#, 1.0), one.clone()).is_err());
        assert!(ExperimentConfig::from_params(params(r#"[{"a":{},"b":{}}]"#, 1.0), one.clone()).is_err());
        assert!(
            ExperimentConfig::from_params(params(r#"[{"a":{"ttl_pin":4}}]"#, 1.0), one.clone())
                .is_err()
        );
        assert!(ExperimentConfig::from_params(params(r#"[{"a":{}}]"#, -1.0), one.clone()).is_err());
        assert!(
            ExperimentConfig::from_params(params(r#"[{"a":{}}]"#, f64::NAN), one.clone()).is_err()
        );
        assert!(matches!(
            ExperimentConfig::from_params(params(r#"[{"a":{}}]"#, 1e30), one.clone()),
            Err(ExperimentError::Invalid(_))
        ));
        assert!(ExperimentConfig::from_params(params(r#"[{"a":{}}]"#, 1.0), Vec::new()).is_err());
    }

    #[test]
    fn test_missing_params_file() {
        let err = ExperimentConfig::load(Path::new("/nonexistent/params.json"), 10.0).unwrap_err();
        assert!(matches!(err, ExperimentError::Io { .. }));
    }
}
