//! Enqueue-time file policy

use crate::config::UploadConfig;
use crate::error::{ValidationError, ValidationReason};
use crate::task::FileDescriptor;

/// Decides whether a selected file may become an upload task.
pub trait FileValidator: Send + Sync {
    fn validate(&self, file: &FileDescriptor) -> Result<(), ValidationError>;
}

/// Size and MIME type policy taken from [`UploadConfig`].
#[derive(Debug, Clone, Default)]
pub struct PolicyValidator {
    max_file_size_bytes: Option<u64>,
    allowed_mime_types: Vec<String>,
}

impl PolicyValidator {
    pub fn new(max_file_size_bytes: Option<u64>, allowed_mime_types: Vec<String>) -> Self {
        PolicyValidator {
            max_file_size_bytes,
            allowed_mime_types: allowed_mime_types
                .into_iter()
                .map(|m| m.trim().to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn from_config(config: &UploadConfig) -> Self {
        Self::new(
            config.max_file_size_bytes,
            config.allowed_mime_types.clone(),
        )
    }

    fn mime_allowed(&self, mime_type: &str) -> bool {
        if self.allowed_mime_types.is_empty() {
            return true;
        }
        // Parameters such as "; charset=utf-8" do not take part in matching
        let essence = mime_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        self.allowed_mime_types.iter().any(|pattern| {
            match pattern.strip_suffix("/*") {
                Some(top_level) => essence
                    .split_once('/')
                    .is_some_and(|(kind, _)| kind == top_level),
                None => *pattern == essence,
            }
        })
    }
}

impl FileValidator for PolicyValidator {
    fn validate(&self, file: &FileDescriptor) -> Result<(), ValidationError> {
        let reject = |reason| {
            Err(ValidationError {
                file_name: file.name.clone(),
                reason,
            })
        };

        if file.name.trim().is_empty() {
            return reject(ValidationReason::EmptyName);
        }
        if let Some(max) = self.max_file_size_bytes {
            if file.size > max {
                return reject(ValidationReason::TooLarge {
                    size: file.size,
                    max,
                });
            }
        }
        if !self.mime_allowed(&file.mime_type) {
            return reject(ValidationReason::UnsupportedType {
                mime_type: file.mime_type.clone(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str, mime: &str, size: usize) -> FileDescriptor {
        FileDescriptor::from_bytes(name, mime, vec![0u8; size])
    }

    #[test]
    fn wildcard_matches_top_level_type_only() {
        let validator = PolicyValidator::new(None, vec!["image/*".into(), "application/pdf".into()]);

        assert!(validator.validate(&file("a.png", "image/png", 1)).is_ok());
        assert!(validator.validate(&file("b.pdf", "Application/PDF", 1)).is_ok());
        assert!(validator
            .validate(&file("c.txt", "text/plain; charset=utf-8", 1))
            .is_err());
        assert!(validator.validate(&file("d", "imagex/png", 1)).is_err());
    }

    #[test]
    fn oversized_file_reports_size_and_limit() {
        let validator = PolicyValidator::new(Some(4), Vec::new());
        let err = validator.validate(&file("big.bin", "application/octet-stream", 5)).unwrap_err();

        assert_eq!(err.file_name, "big.bin");
        assert_eq!(err.reason, ValidationReason::TooLarge { size: 5, max: 4 });
        assert!(validator.validate(&file("ok.bin", "application/octet-stream", 4)).is_ok());
    }

    #[test]
    fn empty_name_is_rejected() {
        let validator = PolicyValidator::default();
        let err = validator.validate(&file("  ", "image/png", 1)).unwrap_err();
        assert_eq!(err.reason, ValidationReason::EmptyName);
    }
}
