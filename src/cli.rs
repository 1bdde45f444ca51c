use crate::config::{CascadeFitMode, RenderConfigOverrides};
use anyhow::{anyhow, bail, Context, Result};
use std::env;
use std::path::PathBuf;

pub const DEFAULT_CONFIG_PATH: &str = "config/deferred.json";
pub const DEFAULT_FRAME_COUNT: u32 = 120;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CliOverrides {
    config_path: Option<PathBuf>,
    frames: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
    shadow_size: Option<u32>,
    anti_flicker: Option<bool>,
}

impl CliOverrides {
    pub fn parse_from_env() -> Result<Self> {
        Self::parse(env::args())
    }

    pub fn parse<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut overrides = CliOverrides::default();
        let mut iter = args.into_iter();
        let _ = iter.next(); // skip program name if present
        while let Some(raw_flag) = iter.next() {
            let flag = raw_flag.as_ref();
            let Some(key) = flag.strip_prefix("--") else {
                bail!("Unexpected argument '{flag}'. Flags take the form --name value.");
            };
            let value =
                iter.next().ok_or_else(|| anyhow!("Expected a value after '{flag}'"))?.as_ref().to_string();
            match key {
                "config" => overrides.config_path = Some(PathBuf::from(value)),
                "frames" => {
                    overrides.frames =
                        Some(value.parse::<u32>().with_context(|| format!("Invalid frame count '{value}'"))?);
                }
                "width" => {
                    overrides.width =
                        Some(value.parse::<u32>().with_context(|| format!("Invalid width '{value}'"))?);
                }
                "height" => {
                    overrides.height =
                        Some(value.parse::<u32>().with_context(|| format!("Invalid height '{value}'"))?);
                }
                "shadow-size" => {
                    overrides.shadow_size =
                        Some(value.parse::<u32>().with_context(|| format!("Invalid shadow size '{value}'"))?);
                }
                "anti-flicker" => {
                    overrides.anti_flicker = Some(parse_bool_flag("anti-flicker", &value)?);
                }
                _ => bail!(
                    "Unknown flag '{flag}'. Supported flags: --config, --frames, --width, --height, \
                     --shadow-size, --anti-flicker."
                ),
            }
        }
        Ok(overrides)
    }

    pub fn config_path(&self) -> PathBuf {
        self.config_path.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    pub fn frames(&self) -> u32 {
        self.frames.unwrap_or(DEFAULT_FRAME_COUNT)
    }

    pub fn into_config_overrides(self) -> RenderConfigOverrides {
        RenderConfigOverrides {
            width: self.width,
            height: self.height,
            shadow_map_size: self.shadow_size,
            fit_mode: self.anti_flicker.map(|enabled| {
                if enabled {
                    CascadeFitMode::Stabilized
                } else {
                    CascadeFitMode::FrustumBounds
                }
            }),
        }
    }

    #[cfg(test)]
    pub fn as_tuple(&self) -> (Option<u32>, Option<u32>, Option<u32>, Option<bool>) {
        (self.width, self.height, self.shadow_size, self.anti_flicker)
    }
}

fn parse_bool_flag(flag: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        other => bail!("Invalid {flag} value '{other}'. Use on/off or true/false."),
    }
}
