pub mod partial;

use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

pub use partial::parse_partial_json;

/// Structured value the model generates. Every field is optional because
/// the same type carries mid-stream snapshots.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Fragment {
    /// Describe what you are about to build and the steps you will take, in detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commentary: Option<String>,
    /// Id of the template the fragment runs on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    /// Short title of the fragment, at most 3 words.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// One-sentence description of the fragment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Packages needed beyond what the template already has installed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_dependencies: Option<Vec<String>>,
    /// Whether additional_dependencies is non-empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_additional_dependencies: Option<bool>,
    /// Command that installs additional_dependencies, e.g. `npm i pkg`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_dependencies_command: Option<String>,
    /// Command that starts the fragment, when the template does not imply one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_command: Option<String>,
    /// Port the fragment listens on, if it serves anything.
    #[serde(
        default,
        deserialize_with = "lenient_port",
        skip_serializing_if = "Option::is_none"
    )]
    #[schemars(with = "Option<u16>")]
    pub port: Option<u16>,
    /// Relative path of the file, including the file name (single-file fragments).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    /// Runnable code: one file's content, or a list of files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<FragmentCode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum FragmentCode {
    Files(Vec<FragmentFile>),
    Single(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FragmentFile {
    /// Relative path of the file, including the file name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    /// Full content of the file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_content: Option<String>,
}

/// A file with both path and content known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: String,
    pub content: String,
}

fn lenient_port<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u16>, D::Error> {
    Ok(match Option::<Value>::deserialize(d)? {
        Some(Value::Number(n)) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

macro_rules! fill {
    ($dst:ident, $src:ident, $($field:ident),+) => {
        $(
            if $src.$field.is_some() {
                $dst.$field = $src.$field;
            }
        )+
    };
}

impl Fragment {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Take every field `snapshot` carries; keep the current value of any
    /// field it lacks. File lists merge per index so a shorter list never
    /// erases files already seen.
    pub fn fill_from(&mut self, mut src: Fragment) {
        let code = src.code.take();
        fill!(
            self,
            src,
            commentary,
            template,
            title,
            description,
            additional_dependencies,
            has_additional_dependencies,
            install_dependencies_command,
            entry_command,
            port,
            file_path
        );

        self.code = match (self.code.take(), code) {
            (Some(FragmentCode::Files(mut old)), Some(FragmentCode::Files(new))) => {
                for (idx, file) in new.into_iter().enumerate() {
                    match old.get_mut(idx) {
                        Some(existing) => {
                            if file.file_path.is_some() {
                                existing.file_path = file.file_path;
                            }
                            if file.file_content.is_some() {
                                existing.file_content = file.file_content;
                            }
                        }
                        None => old.push(file),
                    }
                }
                Some(FragmentCode::Files(old))
            }
            (old, None) => old,
            (_, new) => new,
        };
    }

    /// Normalized file list: entries without a path are skipped.
    pub fn files(&self) -> Vec<FileEntry> {
        match &self.code {
            Some(FragmentCode::Files(files)) => files
                .iter()
                .filter_map(|f| {
                    let path = f.file_path.as_deref().filter(|p| !p.is_empty())?;
                    Some(FileEntry {
                        path: path.to_string(),
                        content: f.file_content.clone().unwrap_or_default(),
                    })
                })
                .collect(),
            Some(FragmentCode::Single(code)) => match self.file_path.as_deref() {
                Some(path) if !path.is_empty() => vec![FileEntry {
                    path: path.to_string(),
                    content: code.clone(),
                }],
                _ => vec![],
            },
            None => vec![],
        }
    }

    /// Code rendered as one text block for the conversation transcript.
    pub fn code_text(&self) -> String {
        match &self.code {
            Some(FragmentCode::Single(code)) => code.clone(),
            Some(FragmentCode::Files(files)) => files
                .iter()
                .map(|f| {
                    let content = f.file_content.as_deref().unwrap_or("");
                    match f.file_path.as_deref() {
                        Some(path) => format!("// {path}\n{content}"),
                        None => content.to_string(),
                    }
                })
                .collect::<Vec<_>>()
                .join("\n\n"),
            None => String::new(),
        }
    }
}

/// JSON schema sent to providers as the structured-output contract.
pub fn fragment_schema() -> Value {
    serde_json::to_value(schemars::schema_for!(Fragment)).unwrap_or_default()
}

/// Best-effort snapshot of the fragment described by a partially streamed
/// JSON text. Anything before the first `{` (such as a code fence) is skipped.
pub fn snapshot_from_text(text: &str) -> Option<Fragment> {
    let start = text.find('{')?;
    let value = parse_partial_json(&text[start..])?;
    if !value.is_object() {
        return None;
    }
    serde_json::from_value(value).ok()
}

/// Response of the sandbox collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxResult {
    #[serde(rename = "sbxId")]
    pub sbx_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub template: String,
    /// Template-specific output (stdout, cell results, ...).
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl SandboxResult {
    /// Interpreter sandboxes have no browsable URL.
    pub fn public_url(&self) -> Option<&str> {
        if self.template == crate::templates::CODE_INTERPRETER {
            None
        } else {
            self.url.as_deref()
        }
    }
}
