use super::RegistrarError;

/// In-memory progress marker of a single registrar.
///
/// Distinct from the persisted job status: a registrar walks
/// `Ready -> Started -> Done` exactly once and is then spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Ready,
    Started,
    Done,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Ready => write!(f, "READY"),
            Stage::Started => write!(f, "STARTED"),
            Stage::Done => write!(f, "DONE"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageEvent {
    Start,
    Finish,
}

impl std::fmt::Display for StageEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageEvent::Start => write!(f, "start"),
            StageEvent::Finish => write!(f, "finish"),
        }
    }
}

/// The only place stage transitions are decided.
pub fn transition(current: Stage, event: StageEvent) -> Result<Stage, RegistrarError> {
    match (current, event) {
        (Stage::Ready, StageEvent::Start) => Ok(Stage::Started),
        (Stage::Started, StageEvent::Finish) => Ok(Stage::Done),
        (stage, event) => Err(RegistrarError::InvalidStage { stage, event }),
    }
}
