use crate::fragment::{Fragment, SandboxResult};
use crate::messages::{ContentPart, Message, Role};

/// Ordered message history owned by one session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Drop the last user/assistant exchange (up to two messages).
    pub fn drop_last_exchange(&mut self) {
        let keep = self.messages.len().saturating_sub(2);
        self.messages.truncate(keep);
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// Attach a sandbox result to the trailing assistant message.
    pub fn attach_result(&mut self, result: SandboxResult) -> bool {
        match self.messages.last_mut() {
            Some(last) if last.role == Role::Assistant => {
                last.result = Some(result);
                true
            }
            _ => false,
        }
    }
}

/// How a snapshot was bound to the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnBinding {
    Appended,
    Updated,
}

/// Folds cumulative fragment snapshots into the conversation's assistant turn.
#[derive(Debug, Default)]
pub struct PartialObjectReconciler {
    current: Fragment,
}

impl PartialObjectReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fragment(&self) -> &Fragment {
        &self.current
    }

    /// Start a new fragment for the next stream.
    pub fn reset(&mut self) {
        self.current = Fragment::default();
    }

    pub fn apply(&mut self, conversation: &mut Conversation, snapshot: Fragment) -> TurnBinding {
        self.current.fill_from(snapshot);
        let content = assistant_content(&self.current);

        match conversation.messages.last_mut() {
            Some(last) if last.role == Role::Assistant => {
                last.content = content;
                last.object = Some(self.current.clone());
                TurnBinding::Updated
            }
            _ => {
                let mut message = Message::new(Role::Assistant, content);
                message.object = Some(self.current.clone());
                conversation.push(message);
                TurnBinding::Appended
            }
        }
    }
}

fn assistant_content(fragment: &Fragment) -> Vec<ContentPart> {
    vec![
        ContentPart::Text {
            text: fragment.commentary.clone().unwrap_or_default(),
        },
        ContentPart::Code {
            text: fragment.code_text(),
        },
    ]
}
