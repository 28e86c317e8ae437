use crate::error::{Error, Result};
use structopt::StructOpt;

pub fn try_bool_from_str(s: &str) -> std::result::Result<bool, String> {
    match s {
        "enable" => Ok(true),
        "disable" => Ok(false),
        _ => Err(format!("{:?} is not one of enable/disable.", s)),
    }
}

pub type BoolParam = bool;

#[derive(Debug, Clone, PartialEq, StructOpt)]
pub struct RenderOptions {
    /// Stop adding samples once each pixel has this many
    #[structopt(long, default_value = "65536", global = true)]
    pub max_samples: u32,

    /// Samples added to each pixel per frame
    #[structopt(short, long, default_value = "4", global = true)]
    pub samples_per_frame: u32,

    /// Maximum number of ray bounces
    #[structopt(short = "b", long, default_value = "8", global = true)]
    pub ray_bounces: u32,

    /// Average samples over frames until the view changes
    #[structopt(long, parse(try_from_str=try_bool_from_str), default_value="enable", global=true)]
    pub accumulate: BoolParam,

    /// Rays that leave the scene pick up light from the sky
    #[structopt(long, parse(try_from_str=try_bool_from_str), default_value="enable", global=true)]
    pub sky: BoolParam,

    /// Radiance scale of the sky
    #[structopt(long, default_value = "5.0", global = true)]
    pub sky_intensity: f32,
}

impl RenderOptions {
    pub fn validate(&self) -> Result<()> {
        if self.samples_per_frame == 0 {
            return Err(Error::InvalidOptions("samples per frame must be at least 1".to_owned()));
        }
        if !(self.sky_intensity >= 0.0) {
            return Err(Error::InvalidOptions(format!(
                "sky intensity {} must be non-negative",
                self.sky_intensity
            )));
        }
        Ok(())
    }

    /// Whether switching from `self` to `other` invalidates previously accumulated samples.
    pub fn invalidates_samples(&self, other: &RenderOptions) -> bool {
        self.samples_per_frame != other.samples_per_frame
            || self.ray_bounces != other.ray_bounces
            || self.accumulate != other.accumulate
            || self.sky != other.sky
            || self.sky_intensity != other.sky_intensity
    }
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            max_samples: 64 * 1024,
            samples_per_frame: 4,
            ray_bounces: 8,
            accumulate: true,
            sky: true,
            sky_intensity: 5.0,
        }
    }
}
