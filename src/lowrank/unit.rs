//! Capability shared by every low-rank layer

use super::{LowRankCore, Phase};
use crate::error::Result;

/// A command broadcast to every low-rank layer of a model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerCommand {
    /// Freeze/unfreeze factors for a phase
    SetPhase(Phase),
    KPreprocess,
    LPreprocess,
    KPostprocess,
    LPostprocess,
    SPreprocess,
    /// Energy-threshold rank selection on `S`
    RankAdaption,
    /// Truncate to a forced rank; `None` keeps each layer's current rank
    Truncate(Option<usize>),
}

/// Layers built on a [`LowRankCore`]
///
/// Every command has a default implementation delegating to the core, so an
/// implementor only exposes its core.
pub trait LowRankUnit {
    fn core(&self) -> &LowRankCore;

    fn core_mut(&mut self) -> &mut LowRankCore;

    /// Run one broadcast command
    fn apply(&mut self, command: &LayerCommand) -> Result<()> {
        let core = self.core_mut();
        match *command {
            LayerCommand::SetPhase(phase) => core.set_phase(phase),
            LayerCommand::KPreprocess => core.k_preprocess()?,
            LayerCommand::LPreprocess => core.l_preprocess()?,
            LayerCommand::KPostprocess => core.k_postprocess()?,
            LayerCommand::LPostprocess => core.l_postprocess()?,
            LayerCommand::SPreprocess => {
                core.s_preprocess()?;
            }
            LayerCommand::RankAdaption => {
                core.rank_adaption()?;
            }
            LayerCommand::Truncate(rank) => {
                core.truncate(rank)?;
            }
        }
        Ok(())
    }

    fn rank(&self) -> usize {
        self.core().rank()
    }

    /// Rank as a fraction of `min(n_in, n_out)`
    fn rank_fraction(&self) -> f32 {
        self.core().rank() as f32 / self.core().full_rank() as f32
    }
}
