// Tunable knobs for a `Vm` instance, loaded from TOML.

use serde::Deserialize;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    pub initial_stack_capacity: usize,
    pub gc_growth_factor: f64,
    pub initial_gc_threshold: usize,
    pub min_gc_threshold: usize,
    pub max_frame_depth: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            initial_stack_capacity: 256,
            gc_growth_factor: 2.0,
            initial_gc_threshold: 1 << 20,
            min_gc_threshold: 1 << 16,
            max_frame_depth: crate::frame::MAX_FRAMES,
        }
    }
}

impl VmConfig {
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_nonzero_thresholds() {
        let c = VmConfig::default();
        assert!(c.initial_gc_threshold > 0);
        assert!(c.gc_growth_factor > 1.0);
    }

    #[test]
    fn partial_toml_overrides_only_named_fields() {
        let c = VmConfig::from_toml("initial_gc_threshold = 4096\n").unwrap();
        assert_eq!(c.initial_gc_threshold, 4096);
        assert_eq!(c.gc_growth_factor, VmConfig::default().gc_growth_factor);
    }
}
