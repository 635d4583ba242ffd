use serde::{Deserialize, Serialize};

use crate::backend::Backend;

/// Store-native SQL passed through verbatim. Only hand-written migrations
/// may carry it, and the snapshot never sees its effects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawStatement {
    pub sql: String,
    /// Backend names the statement runs on. Everywhere when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub only_on: Option<Vec<String>>,
}

impl RawStatement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            only_on: None,
        }
    }

    pub fn only_on(mut self, backends: &[&str]) -> Self {
        self.only_on = Some(backends.iter().map(|b| b.to_string()).collect());
        self
    }

    pub(crate) fn to_sql(&self, backend: &dyn Backend) -> Vec<String> {
        match self.only_on {
            Some(ref only) if !only.iter().any(|b| b == backend.name()) => vec![],
            _ => vec![self.sql.clone()],
        }
    }

    pub fn describe(&self) -> String {
        let mut first_line = self.sql.lines().next().unwrap_or_default().trim().to_string();
        if first_line.len() > 60 {
            let mut cut = 60;
            while !first_line.is_char_boundary(cut) {
                cut -= 1;
            }
            first_line.truncate(cut);
            first_line.push_str("...");
        }
        format!("Run SQL: {}", first_line)
    }
}
