pub mod constants;
pub mod declaration;
pub mod end;
pub mod reducer;
pub mod run;
pub mod sandbox;
pub mod start;

pub mod prelude {
    pub use crate::constants::{END, START};
    pub use crate::declaration::{ChannelDeclaration, StateDeclaration, StateSchema};
    pub use crate::end::{finalize, is_terminal, Delivery, EndOutput, ModelPostProcessor, PostProcessor};
    pub use crate::reducer::{fold_pending_writes, merge_channel, ChannelOp};
    pub use crate::run::{RunPhase, StateRun};
    pub use crate::sandbox::{ScriptContext, ScriptSandbox};
    pub use crate::start::{resolve_latest, seed_checkpoint, start};
}
