use serde_json::Value;

use crate::types::{Section, SectionKind};
use crate::validation::ValidationError;

pub const MAX_SECTIONS: usize = 50;

/// Checks the ordered section list of a sellpage.
///
/// Every config must be a JSON object; a few kinds carry required keys that
/// the storefront cannot render without.
pub fn validate_sections(sections: &[Section]) -> Result<(), ValidationError> {
    if sections.len() > MAX_SECTIONS {
        return Err(ValidationError::new(
            "sections",
            format!("at most {MAX_SECTIONS} sections are allowed"),
        ));
    }

    for (index, section) in sections.iter().enumerate() {
        let Some(config) = section.config.as_object() else {
            return Err(ValidationError::new(
                "sections",
                format!("section {index} config must be an object"),
            ));
        };

        let required = match section.kind {
            SectionKind::RichText => Some(("html", ValueKind::String)),
            SectionKind::Faq | SectionKind::Testimonials | SectionKind::Gallery => {
                Some(("items", ValueKind::Array))
            }
            _ => None,
        };

        if let Some((key, kind)) = required {
            let present = config.get(key).is_some_and(|value| kind.matches(value));
            if !present {
                return Err(ValidationError::new(
                    "sections",
                    format!("section {index} requires '{key}' ({})", kind.as_str()),
                ));
            }
        }
    }

    Ok(())
}

#[derive(Clone, Copy)]
enum ValueKind {
    String,
    Array,
}

impl ValueKind {
    fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Array => value.is_array(),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Array => "array",
        }
    }
}
