//! Question reply formatting

use serde::{Deserialize, Serialize};

/// How a question reply is written out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Reply verbatim
    #[default]
    Text,
    /// `{"question": ..., "reply": ...}` on one line
    Json,
    /// Space separated hex bytes
    Hex,
}

/// Render the reply to `question` for output
pub fn format_reply(question: &str, reply: &str, format: OutputFormat) -> String {
    match format {
        OutputFormat::Text => reply.to_string(),
        OutputFormat::Json => {
            let mut line = serde_json::json!({
                "question": question,
                "reply": reply,
            })
            .to_string();
            line.push('\n');
            line
        }
        OutputFormat::Hex => {
            let mut line = hex_format(reply.as_bytes());
            line.push('\n');
            line
        }
    }
}

fn hex_format(data: &[u8]) -> String {
    data.iter()
        .map(|b| hex::encode([*b]))
        .collect::<Vec<_>>()
        .join(" ")
}
