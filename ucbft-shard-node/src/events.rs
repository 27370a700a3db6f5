//! Node events (spec.md §4.1.3 "Broadcast a `NewRoundStarted` event",
//! §4.1.4 step 5 "Emit `StateReverted`"). Delivered on a broadcast channel
//! rather than through an injected trait object, matching the teacher's
//! own `event_handler` being an optional outbound channel rather than a
//! polymorphic callback (spec.md §6 "`event_handler?`").

use ucbft_types::{HashValue, Round};

#[derive(Clone, Debug)]
pub enum NodeEvent {
    NewRoundStarted { round: Round },
    StateReverted { round: Round },
    BlockFinalized { round: Round, block_hash: HashValue },
    EnteredRecovering { round: Round },
    RecoveryComplete { round: Round },
    ModeChanged { validator: bool },
    EpochChanged { epoch: u64 },
}
