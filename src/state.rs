//! Conversation state machine. Transitions are pure so the coordinator can
//! check a move before doing any I/O for it.

use serde::Serialize;
use std::fmt;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    Chatting,
    AwaitingConfirmation,
    GeneratingFinalPrompt,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEvent {
    /// The evaluator judged the profile complete enough
    ReadyForWriting,
    Confirmed,
    Declined,
    FinalPromptWritten,
    /// The writer call failed; the user may confirm again
    WritingFailed,
}

impl fmt::Display for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConversationState::Chatting => "chatting",
            ConversationState::AwaitingConfirmation => "awaiting_confirmation",
            ConversationState::GeneratingFinalPrompt => "generating_final_prompt",
            ConversationState::Completed => "completed",
        };
        f.write_str(s)
    }
}

impl StateEvent {
    fn action(&self) -> &'static str {
        match self {
            StateEvent::ReadyForWriting => "request confirmation",
            StateEvent::Confirmed => "confirm generation",
            StateEvent::Declined => "decline generation",
            StateEvent::FinalPromptWritten => "finish the final prompt",
            StateEvent::WritingFailed => "abandon the final prompt",
        }
    }
}

pub fn transition(state: ConversationState, event: StateEvent) -> Result<ConversationState> {
    use ConversationState::*;
    use StateEvent::*;

    match (state, event) {
        (Chatting, ReadyForWriting) => Ok(AwaitingConfirmation),
        (AwaitingConfirmation, Confirmed) => Ok(GeneratingFinalPrompt),
        (AwaitingConfirmation, Declined) => Ok(Chatting),
        (GeneratingFinalPrompt, FinalPromptWritten) => Ok(Completed),
        (GeneratingFinalPrompt, WritingFailed) => Ok(AwaitingConfirmation),
        (state, event) => Err(Error::InvalidTransition {
            state: state.to_string(),
            action: event.action().to_string(),
        }),
    }
}
