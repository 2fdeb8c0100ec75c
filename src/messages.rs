use serde::{Deserialize, Serialize};

use crate::fragment::{Fragment, SandboxResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentPart {
    Text { text: String },
    /// Data URL or remote URL.
    Image { image: String },
    Code { text: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentPart>,
    /// Fragment this assistant turn produced, as far as it is known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<Fragment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<SandboxResult>,
}

impl Message {
    pub fn new(role: Role, content: Vec<ContentPart>) -> Self {
        Self {
            role,
            content,
            object: None,
            result: None,
        }
    }

    pub fn user(content: Vec<ContentPart>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Self::user(vec![ContentPart::Text { text: text.into() }])
    }

    /// Copy without the client-only fragment and preview attachments or
    /// blank text parts. `None` when nothing is left to send.
    pub fn for_provider(&self) -> Option<Self> {
        let content: Vec<ContentPart> = self
            .content
            .iter()
            .filter(|p| match p {
                ContentPart::Text { text } | ContentPart::Code { text } => !text.trim().is_empty(),
                ContentPart::Image { .. } => true,
            })
            .cloned()
            .collect();
        if content.is_empty() {
            return None;
        }
        Some(Self::new(self.role, content))
    }

    /// Text and code parts joined by newlines; images are skipped.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } | ContentPart::Code { text } => Some(text.as_str()),
                ContentPart::Image { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}
