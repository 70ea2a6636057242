use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;

#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    SaveFact,
    GenerateFact,
    GenerateImage,
    TextToSpeech,
    GenerateMarkdown,
}

impl Action {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SaveFact => "save_fact",
            Self::GenerateFact => "generate_fact",
            Self::GenerateImage => "generate_image",
            Self::TextToSpeech => "text_to_speech",
            Self::GenerateMarkdown => "generate_markdown",
        }
    }
}

/// One busy slot per action; actions never block each other.
#[derive(Debug, Clone, Default)]
pub struct BusyRegistry {
    active: Arc<Mutex<BTreeSet<Action>>>,
}

impl BusyRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, BTreeSet<Action>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claims the slot for `action`, or `None` if that action is already running.
    /// The slot is released when the guard drops, on every exit path.
    #[must_use]
    pub fn try_begin(&self, action: Action) -> Option<BusyGuard> {
        if self.slots().insert(action) {
            Some(BusyGuard {
                registry: self.clone(),
                action,
            })
        } else {
            None
        }
    }

    #[must_use]
    pub fn is_busy(&self, action: Action) -> bool {
        self.slots().contains(&action)
    }

    #[must_use]
    pub fn active(&self) -> Vec<Action> {
        self.slots().iter().copied().collect()
    }
}

#[derive(Debug)]
pub struct BusyGuard {
    registry: BusyRegistry,
    action: Action,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.registry.slots().remove(&self.action);
    }
}
