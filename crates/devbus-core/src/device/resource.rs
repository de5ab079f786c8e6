// ── Per-device system resources ──
//
// Thirteen well-known device properties tune the black box and polling.
// The name/value pair lists are flattened `[name, value, name, value, ...]`
// sequences; names are lower-cased on load.

use devbus_api::{DbDatum, Reason};
use serde::Serialize;

use crate::error::CoreError;

pub const DEFAULT_POLL_RING_DEPTH: usize = 10;
pub const DEFAULT_POLL_OLD_FACTOR: u32 = 4;
pub const DEFAULT_BLACKBOX_DEPTH: usize = 50;
pub const DEFAULT_DESCRIPTION: &str = "A devbus device";

pub const SYSTEM_PROPERTIES: [&str; 13] = [
    "blackbox_depth",
    "description",
    "poll_ring_depth",
    "polled_cmd",
    "polled_attr",
    "non_auto_polled_cmd",
    "non_auto_polled_attr",
    "poll_old_factor",
    "cmd_poll_ring_depth",
    "attr_poll_ring_depth",
    "min_poll_period",
    "cmd_min_poll_period",
    "attr_min_poll_period",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SystemResources {
    pub blackbox_depth: usize,
    pub description: String,
    /// Zero means "use the default depth".
    pub poll_ring_depth: usize,
    pub polled_cmd: Vec<String>,
    pub polled_attr: Vec<String>,
    pub non_auto_polled_cmd: Vec<String>,
    pub non_auto_polled_attr: Vec<String>,
    pub poll_old_factor: u32,
    pub cmd_poll_ring_depth: Vec<String>,
    pub attr_poll_ring_depth: Vec<String>,
    /// Milliseconds; zero means no minimum.
    pub min_poll_period: u64,
    pub cmd_min_poll_period: Vec<String>,
    pub attr_min_poll_period: Vec<String>,
}

impl Default for SystemResources {
    fn default() -> Self {
        Self {
            blackbox_depth: DEFAULT_BLACKBOX_DEPTH,
            description: DEFAULT_DESCRIPTION.into(),
            poll_ring_depth: 0,
            polled_cmd: Vec::new(),
            polled_attr: Vec::new(),
            non_auto_polled_cmd: Vec::new(),
            non_auto_polled_attr: Vec::new(),
            poll_old_factor: DEFAULT_POLL_OLD_FACTOR,
            cmd_poll_ring_depth: Vec::new(),
            attr_poll_ring_depth: Vec::new(),
            min_poll_period: 0,
            cmd_min_poll_period: Vec::new(),
            attr_min_poll_period: Vec::new(),
        }
    }
}

impl SystemResources {
    /// Build from fetched properties. Malformed entries keep their default
    /// (pair lists are left empty) and are reported in the second element.
    pub fn from_properties(device: &str, data: &[DbDatum]) -> (Self, Vec<CoreError>) {
        let mut res = Self::default();
        let mut errors = Vec::new();
        let bad = |prop: &str| {
            CoreError::config(
                Reason::BadConfigurationProperty,
                format!("System property {prop} for device {device} has wrong syntax"),
            )
        };

        for datum in data.iter().filter(|d| !d.is_empty()) {
            let prop = datum.name.to_ascii_lowercase();
            match prop.as_str() {
                "description" => res.description = datum.values.join("\n"),
                "blackbox_depth" => match parse_first(datum) {
                    Some(v) => res.blackbox_depth = v,
                    None => errors.push(bad(&prop)),
                },
                "poll_ring_depth" => match parse_first(datum) {
                    Some(v) => res.poll_ring_depth = v,
                    None => errors.push(bad(&prop)),
                },
                "poll_old_factor" => match parse_first(datum) {
                    Some(v) => res.poll_old_factor = v,
                    None => errors.push(bad(&prop)),
                },
                "min_poll_period" => match parse_first(datum) {
                    Some(v) => res.min_poll_period = v,
                    None => errors.push(bad(&prop)),
                },
                "polled_cmd"
                | "polled_attr"
                | "non_auto_polled_cmd"
                | "non_auto_polled_attr"
                | "cmd_poll_ring_depth"
                | "attr_poll_ring_depth"
                | "cmd_min_poll_period"
                | "attr_min_poll_period" => {
                    let paired = matches!(
                        prop.as_str(),
                        "polled_cmd"
                            | "polled_attr"
                            | "cmd_poll_ring_depth"
                            | "attr_poll_ring_depth"
                            | "cmd_min_poll_period"
                            | "attr_min_poll_period"
                    );
                    let list = if paired {
                        if datum.values.len() % 2 == 0 {
                            lower_names(&datum.values)
                        } else {
                            errors.push(bad(&prop));
                            Vec::new()
                        }
                    } else {
                        datum.values.iter().map(|v| v.to_ascii_lowercase()).collect()
                    };
                    *res.list_mut(&prop) = list;
                }
                _ => {}
            }
        }
        (res, errors)
    }

    fn list_mut(&mut self, prop: &str) -> &mut Vec<String> {
        match prop {
            "polled_cmd" => &mut self.polled_cmd,
            "polled_attr" => &mut self.polled_attr,
            "non_auto_polled_cmd" => &mut self.non_auto_polled_cmd,
            "non_auto_polled_attr" => &mut self.non_auto_polled_attr,
            "cmd_poll_ring_depth" => &mut self.cmd_poll_ring_depth,
            "attr_poll_ring_depth" => &mut self.attr_poll_ring_depth,
            "cmd_min_poll_period" => &mut self.cmd_min_poll_period,
            _ => &mut self.attr_min_poll_period,
        }
    }

    // ── Lookups ─────────────────────────────────────────────────────

    pub fn poll_ring_depth(&self) -> usize {
        if self.poll_ring_depth == 0 {
            DEFAULT_POLL_RING_DEPTH
        } else {
            self.poll_ring_depth
        }
    }

    pub fn cmd_poll_ring_depth(&self, cmd: &str) -> usize {
        pair_lookup(&self.cmd_poll_ring_depth, cmd).unwrap_or_else(|| self.poll_ring_depth())
    }

    pub fn attr_poll_ring_depth(&self, attr: &str) -> usize {
        pair_lookup(&self.attr_poll_ring_depth, attr).unwrap_or_else(|| self.poll_ring_depth())
    }

    /// Minimum period for a command, falling back to the device-wide one.
    pub fn cmd_min_poll_period(&self, cmd: &str) -> u64 {
        pair_lookup(&self.cmd_min_poll_period, cmd).unwrap_or(self.min_poll_period)
    }

    pub fn attr_min_poll_period(&self, attr: &str) -> u64 {
        pair_lookup(&self.attr_min_poll_period, attr).unwrap_or(self.min_poll_period)
    }

    /// `(name, period ms)` pairs from `polled_attr`.
    pub fn polled_attributes(&self) -> Vec<(String, u64)> {
        pairs(&self.polled_attr)
    }

    pub fn polled_commands(&self) -> Vec<(String, u64)> {
        pairs(&self.polled_cmd)
    }
}

fn parse_first<T: std::str::FromStr>(datum: &DbDatum) -> Option<T> {
    datum.first()?.trim().parse().ok()
}

fn lower_names(values: &[String]) -> Vec<String> {
    values
        .iter()
        .enumerate()
        .map(|(i, v)| if i % 2 == 0 { v.to_ascii_lowercase() } else { v.clone() })
        .collect()
}

fn pair_lookup<T: std::str::FromStr>(list: &[String], name: &str) -> Option<T> {
    list.chunks_exact(2)
        .find(|pair| pair[0].eq_ignore_ascii_case(name))
        .and_then(|pair| pair[1].trim().parse().ok())
}

fn pairs(list: &[String]) -> Vec<(String, u64)> {
    list.chunks_exact(2)
        .filter_map(|pair| Some((pair[0].clone(), pair[1].trim().parse().ok()?)))
        .collect()
}
