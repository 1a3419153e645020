use std::{fs, io, path::Path};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClassTableError {
    #[error("failed to read class names from {path}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// Class labels indexed by class id, one per line of the source file.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClassNames {
    names: Vec<String>,
}

impl ClassNames {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ClassTableError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ClassTableError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self::parse(&text))
    }

    pub fn parse(text: &str) -> Self {
        Self {
            names: text
                .lines()
                .map(|line| line.trim_end_matches('\r').to_string())
                .collect(),
        }
    }

    /// Label for `class_id`, `None` when negative or past the end of the table.
    pub fn label(&self, class_id: i32) -> Option<&str> {
        usize::try_from(class_id)
            .ok()
            .and_then(|index| self.names.get(index))
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
