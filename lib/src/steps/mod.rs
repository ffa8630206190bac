//! The build pipeline: an ordered list of named steps iterated forward,
//! with best-effort cleanup invoked in reverse order on halt.

pub(crate) mod base_image;
pub(crate) mod cache;
pub(crate) mod check;
pub(crate) mod contents;
pub(crate) mod image;
pub(crate) mod oci;
pub(crate) mod sizes;

use anyhow::Result;

use crate::context::RunContext;
use crate::glyph::Glyph;
use crate::output;

/// Every pipeline step, in no particular order; the pipeline order lives
/// in [`ALL_STEPS`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    CheckRequirements,
    CheckInputs,
    CheckCache,
    PrintingCache,
    ApplyCachePolicy,
    CheckURLs,
    ComputeSizes,
    DownloadImage,
    ResizingImage,
    MountingDataPart,
    DownloadingOCIImages,
    ProcessingLocalContent,
    DownloadingContent,
    UnmountingDataPart,
    MountingBootPart,
    WritingOffspotConfig,
    UnmountingBootPart,
    DetachingImage,
    GivingFeedback,
}

/// The pipeline, in execution order.
pub(crate) const ALL_STEPS: [Step; 19] = [
    Step::CheckRequirements,
    Step::CheckInputs,
    Step::CheckCache,
    Step::PrintingCache,
    Step::ApplyCachePolicy,
    Step::CheckURLs,
    Step::ComputeSizes,
    // --check stops here
    Step::DownloadImage,
    Step::ResizingImage,
    Step::MountingDataPart,
    Step::DownloadingOCIImages,
    Step::ProcessingLocalContent,
    Step::DownloadingContent,
    Step::UnmountingDataPart,
    Step::MountingBootPart,
    Step::WritingOffspotConfig,
    Step::UnmountingBootPart,
    Step::DetachingImage,
    Step::GivingFeedback,
];

impl Step {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Step::CheckRequirements => "Checking system requirements",
            Step::CheckInputs => "Checking config inputs",
            Step::CheckCache => "Checking cache policy",
            Step::PrintingCache => "Printing cache content",
            Step::ApplyCachePolicy => "Enforcing cache policy",
            Step::CheckURLs => "Checking all sources",
            Step::ComputeSizes => "Computing sizes",
            Step::DownloadImage => "Fetching base image",
            Step::ResizingImage => "Resizing image",
            Step::MountingDataPart => "Mounting data partition",
            Step::DownloadingOCIImages => "Downloading OCI images",
            Step::ProcessingLocalContent => "Processing local contents",
            Step::DownloadingContent => "Downloading content",
            Step::UnmountingDataPart => "Unmounting data partition",
            Step::MountingBootPart => "Mounting boot partition",
            Step::WritingOffspotConfig => "Writing offspot config",
            Step::UnmountingBootPart => "Unmounting boot partition",
            Step::DetachingImage => "Detaching image",
            Step::GivingFeedback => "Giving creation feedback",
        }
    }

    /// Run the step; 0 means success, any other value halts the pipeline
    /// and becomes the process exit code.
    pub(crate) fn run(&self, ctx: &mut RunContext) -> Result<i32> {
        match self {
            Step::CheckRequirements => check::check_requirements(ctx),
            Step::CheckInputs => check::check_inputs(ctx),
            Step::CheckCache => cache::check_cache(ctx),
            Step::PrintingCache => cache::printing_cache(ctx),
            Step::ApplyCachePolicy => cache::apply_cache_policy(ctx),
            Step::CheckURLs => check::check_urls(ctx),
            Step::ComputeSizes => sizes::compute_sizes(ctx),
            Step::DownloadImage => base_image::download_image(ctx),
            Step::ResizingImage => image::resizing_image(ctx),
            Step::MountingDataPart => image::mounting_data_part(ctx),
            Step::DownloadingOCIImages => oci::downloading_oci_images(ctx),
            Step::ProcessingLocalContent => contents::processing_local_content(ctx),
            Step::DownloadingContent => contents::downloading_content(ctx),
            Step::UnmountingDataPart => image::unmounting_data_part(ctx),
            Step::MountingBootPart => image::mounting_boot_part(ctx),
            Step::WritingOffspotConfig => check::writing_offspot_config(ctx),
            Step::UnmountingBootPart => image::unmounting_boot_part(ctx),
            Step::DetachingImage => image::detaching_image(ctx),
            Step::GivingFeedback => giving_feedback(ctx),
        }
    }

    /// Release whatever the step's `run` acquired; must not fail.
    pub(crate) fn cleanup(&self, ctx: &mut RunContext) {
        match self {
            Step::ResizingImage => {
                if let Some(image) = ctx.image.as_mut() {
                    image.detach();
                }
            }
            Step::MountingDataPart => {
                if let Some(image) = ctx.image.as_mut() {
                    if let Err(e) = image.unmount_p3() {
                        tracing::debug!("cleanup unmount p3: {e:#}");
                    }
                }
            }
            Step::MountingBootPart => {
                if let Some(image) = ctx.image.as_mut() {
                    if let Err(e) = image.unmount_p1() {
                        tracing::debug!("cleanup unmount p1: {e:#}");
                    }
                }
            }
            _ => {}
        }
    }
}

fn giving_feedback(ctx: &mut RunContext) -> Result<i32> {
    ctx.succeeded = true;
    let line = output::TaskLine::start("Image created successfully");
    line.succeed(&ctx.options.output_path);
    Ok(0)
}

/// Ordered step list with a forward cursor and a reverse cleanup walk.
#[derive(Debug)]
pub(crate) struct StepMachine {
    steps: Vec<Step>,
    /// Index of the last step that started.
    reached: usize,
    halted: bool,
}

impl StepMachine {
    pub(crate) fn new() -> Self {
        Self {
            steps: ALL_STEPS.to_vec(),
            reached: 0,
            halted: false,
        }
    }

    /// Truncate the pipeline so `step` is the last one to run.
    pub(crate) fn halt_after(&mut self, step: Step) {
        if let Some(index) = self.steps.iter().position(|s| *s == step) {
            self.steps.truncate(index + 1);
        }
    }

    /// Drop a single step from the pipeline.
    pub(crate) fn remove_step(&mut self, step: Step) {
        self.steps.retain(|s| *s != step);
    }

    pub(crate) fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Run steps in order until one fails. Returns the exit code (0 on
    /// full success).
    pub(crate) fn run(&mut self, ctx: &mut RunContext) -> Result<i32> {
        let total = self.steps.len();
        for index in 0..total {
            let step = self.steps[index];
            self.reached = index;
            output::step_header(index + 1, total, step.name());
            let code = step.run(ctx)?;
            if code != 0 {
                eprintln!("error: step {:?} returned {code}", step);
                return Ok(code);
            }
        }
        Ok(0)
    }

    /// Release resources of every started step, in reverse order, then
    /// remove the output image unless the run succeeded or the user asked
    /// to keep failures. Idempotent, never fails.
    pub(crate) fn halt(&mut self, ctx: &mut RunContext) {
        if self.halted {
            return;
        }
        self.halted = true;
        print!("Cleaning-up… ");

        // stop outstanding downloads before releasing mounts and devices
        if let Some(mut downloader) = ctx.downloader.take() {
            downloader.shutdown();
            output::add_dot(Glyph::Neutral);
        }

        for index in (1..=self.reached).rev() {
            self.steps[index].cleanup(ctx);
            output::add_dot(Glyph::Ok);
        }

        let output_path = &ctx.options.output_path;
        if !ctx.succeeded && !ctx.options.keep_failed && output_path.exists() {
            match std::fs::remove_file(output_path) {
                Ok(()) => output::add_dot(Glyph::Ok),
                Err(e) => {
                    tracing::warn!("could not remove {output_path}: {e}");
                    output::add_dot(Glyph::Nok);
                }
            }
        }
        println!();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_order() {
        let machine = StepMachine::new();
        let steps = machine.steps();
        assert_eq!(steps[0], Step::CheckRequirements);
        assert_eq!(*steps.last().unwrap(), Step::GivingFeedback);
        // mounts strictly precede their unmounts
        let pos = |s: Step| steps.iter().position(|x| *x == s).unwrap();
        assert!(pos(Step::MountingDataPart) < pos(Step::DownloadingContent));
        assert!(pos(Step::DownloadingContent) < pos(Step::UnmountingDataPart));
        assert!(pos(Step::MountingBootPart) < pos(Step::WritingOffspotConfig));
        assert!(pos(Step::WritingOffspotConfig) < pos(Step::UnmountingBootPart));
        assert!(pos(Step::UnmountingBootPart) < pos(Step::DetachingImage));
    }

    #[test]
    fn test_halt_after() {
        let mut machine = StepMachine::new();
        machine.halt_after(Step::ComputeSizes);
        assert_eq!(*machine.steps().last().unwrap(), Step::ComputeSizes);
        assert_eq!(machine.steps().len(), 7);
    }

    #[test]
    fn test_remove_step() {
        let mut machine = StepMachine::new();
        let before = machine.steps().len();
        machine.remove_step(Step::PrintingCache);
        assert_eq!(machine.steps().len(), before - 1);
        assert!(!machine.steps().contains(&Step::PrintingCache));
    }
}
