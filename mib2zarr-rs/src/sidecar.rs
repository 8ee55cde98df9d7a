use log::{debug, warn};
use serde::Serialize;
use serde_json::{Map, Value};
use std::fs;
use std::path::Path;

/// The sidecar object, keys kept in file order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SidecarParameters(Map<String, Value>);

impl SidecarParameters {
    pub fn new(map: Map<String, Value>) -> Self {
        Self(map)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn navigation_shape(&self) -> Option<Vec<usize>> {
        let value = self.get("navigation_shape")?;
        let shape = value.as_array().and_then(|items| {
            items
                .iter()
                .map(as_positive_integer)
                .collect::<Option<Vec<usize>>>()
        });
        match shape {
            Some(s) if !s.is_empty() => Some(s),
            _ => {
                warn!("Ignoring invalid navigation_shape {} in sidecar", value);
                None
            }
        }
    }

    /// Coerced to an integer; floats are truncated, numeric strings parsed.
    pub fn lineskip(&self) -> Option<usize> {
        let value = self.get("lineskip")?;
        let skip = match value {
            Value::Number(n) => n
                .as_u64()
                .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f.trunc() as u64)),
            Value::String(s) => s.trim().parse::<u64>().ok(),
            _ => None,
        };
        match skip {
            Some(s) => Some(s as usize),
            None => {
                warn!("Ignoring invalid lineskip {} in sidecar", value);
                None
            }
        }
    }

    pub fn sample(&self) -> Option<String> {
        match self.get("sample")? {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    pub fn float(&self, key: &str) -> Option<f64> {
        let value = self.get(key)?;
        let parsed = match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            Value::Null => return None,
            _ => None,
        };
        if parsed.is_none() {
            debug!("Ignoring non-numeric sidecar value {}={}", key, value);
        }
        parsed
    }
}

fn as_positive_integer(v: &Value) -> Option<usize> {
    if let Some(u) = v.as_u64() {
        return (u > 0).then_some(u as usize);
    }
    let f = v.as_f64()?;
    (f >= 1.0 && f.fract() == 0.0).then_some(f as usize)
}

/// Load `<stem>.json`. Missing or unreadable files give an empty mapping.
pub fn load_sidecar(path: &Path) -> SidecarParameters {
    if !path.is_file() {
        return SidecarParameters::default();
    }
    let parsed = fs::read_to_string(path)
        .map_err(anyhow::Error::from)
        .and_then(|text| serde_json::from_str::<Value>(&text).map_err(anyhow::Error::from));
    match parsed {
        Ok(Value::Object(map)) => {
            debug!("Loaded metadata from json file {}: {:?}", path.display(), map);
            SidecarParameters::new(map)
        }
        Ok(other) => {
            debug!(
                "Sidecar {} is not a JSON object ({}). Metadata must be set manually later on",
                path.display(),
                other
            );
            SidecarParameters::default()
        }
        Err(e) => {
            debug!(
                "Could not get parameters from json file {}: {}. Metadata must be set manually later on",
                path.display(),
                e
            );
            SidecarParameters::default()
        }
    }
}

/// Recognised experimental parameters. Other sidecar keys are not forwarded.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExperimentalParameters {
    pub beam_energy: Option<f64>,
    pub camera_length: Option<f64>,
    pub scan_rotation: Option<f64>,
    pub rocking_angle: Option<f64>,
    pub rocking_frequency: Option<f64>,
    pub exposure_time: Option<f64>,
}

impl ExperimentalParameters {
    pub fn from_sidecar(params: &SidecarParameters) -> Self {
        Self {
            beam_energy: params.float("beam_energy"),
            camera_length: params
                .float("cameralength")
                .or_else(|| params.float("camera_length")),
            scan_rotation: params.float("scan_rotation"),
            rocking_angle: params.float("rocking_angle"),
            rocking_frequency: params.float("rocking_frequency"),
            exposure_time: params.float("exposure_time"),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Navigation axis scales derived from the `dx`/`dy` step sizes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepSizes {
    /// Scale applied to every navigation axis.
    pub base: f64,
    /// Replaces the scale of the first (x) navigation axis.
    pub x: Option<f64>,
}

impl StepSizes {
    pub fn from_sidecar(params: &SidecarParameters) -> Option<Self> {
        Self::resolve(params.float("dx"), params.float("dy"))
    }

    pub fn resolve(dx: Option<f64>, dy: Option<f64>) -> Option<Self> {
        match (dx, dy) {
            (None, None) => {
                debug!("Step sizes are not set");
                None
            }
            (None, Some(dy)) => Some(Self { base: dy, x: None }),
            (Some(dx), None) => Some(Self { base: dx, x: None }),
            (Some(dx), Some(dy)) => Some(Self { base: dy, x: Some(dx) }),
        }
    }

    pub fn scale_for_axis(&self, axis: usize) -> f64 {
        match (axis, self.x) {
            (0, Some(x)) => x,
            _ => self.base,
        }
    }
}
