use crate::options::RenderOptions;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumulationState {
    /// The next frame starts from an empty running average.
    Reset,
    /// Samples taken so far for every pixel.
    Accumulating(u32),
}

/// Changes observed by the presentation layer since the previous frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameEvents {
    pub camera_changed: bool,
    pub resized: bool,
}

/// Progressive sample count with the policy for when accumulated samples become invalid.
#[derive(Debug, Clone)]
pub struct AccumulationController {
    state: AccumulationState,
    options: RenderOptions,
}

impl AccumulationController {
    pub fn new(options: RenderOptions) -> Self {
        Self {
            state: AccumulationState::Reset,
            options,
        }
    }

    pub fn state(&self) -> AccumulationState {
        self.state
    }

    pub fn options(&self) -> &RenderOptions {
        &self.options
    }

    pub fn sample_count(&self) -> u32 {
        match self.state {
            AccumulationState::Reset => 0,
            AccumulationState::Accumulating(n) => n,
        }
    }

    pub fn is_converged(&self) -> bool {
        self.sample_count() >= self.options.max_samples
    }

    pub fn reset(&mut self) {
        self.state = AccumulationState::Reset;
    }

    /// Replaces the options, resetting if the change affects how samples are generated.
    pub fn set_options(&mut self, options: RenderOptions) {
        if self.options.invalidates_samples(&options) {
            debug!("render options changed, resetting accumulation");
            self.reset();
        }
        self.options = options;
    }

    /// Evaluates one frame and returns the sample count to render it with.
    pub fn advance(&mut self, events: FrameEvents) -> u32 {
        if events.camera_changed || events.resized || !self.options.accumulate {
            self.reset();
        }

        let count = self.sample_count();
        let count = if count < self.options.max_samples {
            count
                .saturating_add(self.options.samples_per_frame)
                .min(self.options.max_samples)
        } else {
            count
        };

        self.state = AccumulationState::Accumulating(count);
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(max_samples: u32, samples_per_frame: u32) -> AccumulationController {
        AccumulationController::new(RenderOptions {
            max_samples,
            samples_per_frame,
            ..Default::default()
        })
    }

    #[test]
    fn counts_grow_to_ceiling() {
        for &(max, spf) in &[(64, 4), (10, 3), (5, 8), (1, 1)] {
            let mut acc = controller(max, spf);
            for k in 1..=40u32 {
                assert_eq!(acc.advance(FrameEvents::default()), (k * spf).min(max));
            }
        }
    }

    #[test]
    fn sixteen_frames_reach_sixty_four() {
        let mut acc = controller(64, 4);
        for _ in 0..16 {
            acc.advance(FrameEvents::default());
        }
        assert_eq!(acc.sample_count(), 64);
        assert!(acc.is_converged());
        assert_eq!(acc.advance(FrameEvents::default()), 64);
        assert_eq!(acc.state(), AccumulationState::Accumulating(64));
    }

    #[test]
    fn camera_change_restarts_from_one_frame() {
        let mut acc = controller(64, 4);
        for _ in 0..5 {
            acc.advance(FrameEvents::default());
        }
        let count = acc.advance(FrameEvents {
            camera_changed: true,
            ..Default::default()
        });
        assert_eq!(count, 4);
        assert_eq!(acc.advance(FrameEvents::default()), 8);
    }

    #[test]
    fn resize_restarts() {
        let mut acc = controller(64, 4);
        acc.advance(FrameEvents::default());
        acc.advance(FrameEvents::default());
        let count = acc.advance(FrameEvents {
            resized: true,
            ..Default::default()
        });
        assert_eq!(count, 4);
    }

    #[test]
    fn large_batches_saturate_at_ceiling() {
        let mut acc = controller(u32::MAX, u32::MAX - 1);
        assert_eq!(acc.advance(FrameEvents::default()), u32::MAX - 1);
        assert_eq!(acc.advance(FrameEvents::default()), u32::MAX);
        assert!(acc.is_converged());
        assert_eq!(acc.advance(FrameEvents::default()), u32::MAX);
    }

    #[test]
    fn disabled_accumulation_renders_single_frames() {
        let mut acc = AccumulationController::new(RenderOptions {
            accumulate: false,
            ..Default::default()
        });
        for _ in 0..10 {
            assert_eq!(acc.advance(FrameEvents::default()), 4);
        }
    }

    #[test]
    fn reset_state_is_visible_until_next_frame() {
        let mut acc = controller(64, 4);
        acc.advance(FrameEvents::default());
        acc.reset();
        assert_eq!(acc.state(), AccumulationState::Reset);
        assert_eq!(acc.sample_count(), 0);
        assert_eq!(acc.advance(FrameEvents::default()), 4);
    }

    #[test]
    fn option_changes_reset_only_when_samples_differ() {
        let mut acc = controller(64, 4);
        for _ in 0..3 {
            acc.advance(FrameEvents::default());
        }

        acc.set_options(RenderOptions {
            max_samples: 128,
            samples_per_frame: 4,
            ..Default::default()
        });
        assert_eq!(acc.sample_count(), 12);

        acc.set_options(RenderOptions {
            max_samples: 128,
            samples_per_frame: 4,
            sky: false,
            ..Default::default()
        });
        assert_eq!(acc.state(), AccumulationState::Reset);
        assert_eq!(acc.advance(FrameEvents::default()), 4);
    }
}
