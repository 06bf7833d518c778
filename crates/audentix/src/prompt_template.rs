use include_dir::{include_dir, Dir};
use serde::Serialize;
use tera::{Context, Error as TeraError, Tera};

use crate::emailjs::BUSINESS_INBOX;

// Prompts ship inside the binary so the server has no runtime file dependencies
static PROMPTS: Dir = include_dir!("$CARGO_MANIFEST_DIR/src/prompts");

pub fn load_prompt<T: Serialize>(template: &str, context_data: &T) -> Result<String, TeraError> {
    let mut tera = Tera::default();
    tera.add_raw_template("inline_template", template)?;
    let context = Context::from_serialize(context_data)?;
    let rendered = tera.render("inline_template", &context)?;
    Ok(rendered)
}

/// Render one of the embedded prompt templates by file name, e.g. `system.md`
pub fn load_prompt_file<T: Serialize>(
    template_file: &str,
    context_data: &T,
) -> Result<String, TeraError> {
    let template_content = PROMPTS
        .get_file(template_file)
        .and_then(|file| file.contents_utf8())
        .ok_or_else(|| TeraError::msg(format!("Prompt template not found: {}", template_file)))?;
    load_prompt(template_content, context_data)
}

/// Public contact details the assistant quotes to visitors
#[derive(Debug, Clone, Serialize)]
pub struct CompanyProfile {
    pub name: String,
    pub website: String,
    pub location: String,
    pub email: String,
    pub phone: String,
}

impl Default for CompanyProfile {
    fn default() -> Self {
        Self {
            name: "Audentix".to_string(),
            website: "audentix.com".to_string(),
            location: "Jammu, India".to_string(),
            email: BUSINESS_INBOX.to_string(),
            phone: "+91 7006082958".to_string(),
        }
    }
}
