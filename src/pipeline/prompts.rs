use std::fmt::Write;

use serde_json::{json, Value};

use crate::taxonomy::{ActivityCategory, TaxonomySnapshot, IDLE_ACTIVITY_ID};

const SINGLE_SCREEN_DESCRIPTION: &str = "A brief description of the user's activities based on \
the screenshot. Describe enough things to understand what is the main activity the user is \
engaged in.";

const MULTI_SCREEN_DESCRIPTION: &str = "You are viewing screenshots from the user's multiple \
monitors. The images are provided in order: Screen 1, Screen 2, etc.";

const PRIMARY_SCREEN_CUES: &str = "Verify the PRIMARY screen by also looking for visual cues:
- Mouse cursor position
- Active/focused window indicators (highlighted title bar, focus rings)
- Text input carets or selection highlights
- The most prominent application window

Provide:
1. The screen number (1, 2, etc.) of the PRIMARY screen
2. A description of the main activity on the PRIMARY screen
3. Brief context about what's on secondary screens (if notable)";

const CLASSIFICATION_INTRO: &str = "You are given a description of a screenshot taken from a \
user's computer.
It describes various elements visible on the screen.
Based on this description, identify the main activity the user is engaged in.

The user might be during their day job, taking a break, or doing personal tasks.
We want to differentiate between work-related and personal activities.";

const CLASSIFICATION_RULES: &str = "If multiple activities are detected, select only the main \
one and the most specific.
For example, if the user is looking at their calendar from a browser, prefer a calendar category \
over a browsing one.
If the screen shows a lock screen, a screensaver or nothing the user is engaged with, select idle.";

/// Sentence that tells the vision model which display is focused. The application name is a
/// hint only, the model is told to trust the pixels over it.
fn active_screen_hint(active_screen: usize, app_name: Option<&str>) -> String {
    let mut hint = format!(
        "IMPORTANT: Based on system information, Screen {active_screen} currently contains the \
         focused/active window. Use this as a strong hint for identifying the PRIMARY screen."
    );
    if let Some(app_name) = app_name {
        let _ = write!(
            hint,
            "\nThe focused application appears to be \"{app_name}\". Treat this as a hint only, \
             what is visible on the screen takes precedence."
        );
    }
    hint
}

pub fn single_screen_prompt(app_name: Option<&str>) -> String {
    let mut prompt = active_screen_hint(1, app_name);
    prompt.push_str("\n\n");
    prompt.push_str(SINGLE_SCREEN_DESCRIPTION);
    prompt
}

pub fn multi_screen_prompt(active_screen: usize, app_name: Option<&str>) -> String {
    format!(
        "{MULTI_SCREEN_DESCRIPTION}\n\n{}\n\n{PRIMARY_SCREEN_CUES}",
        active_screen_hint(active_screen, app_name)
    )
}

/// Output schema of the vision model when it sees more than one screen.
pub fn multi_screen_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "primary_screen": {"type": "integer"},
            "main_activity_description": {"type": "string"},
            "secondary_context": {"type": ["string", "null"]}
        },
        "required": ["primary_screen", "main_activity_description", "secondary_context"],
        "additionalProperties": false
    })
}

/// Output schema of the classification. The activity is an enum of exactly the snapshot's ids
/// plus idle, so providers with constrained generation can't produce anything else.
pub fn classification_schema(taxonomy: &TaxonomySnapshot) -> Value {
    json!({
        "type": "object",
        "properties": {
            "main_activity": {"type": "string", "enum": taxonomy.allowed_ids()},
            "reasoning": {"type": "string"}
        },
        "required": ["main_activity", "reasoning"],
        "additionalProperties": false
    })
}

fn list_category(prompt: &mut String, taxonomy: &TaxonomySnapshot, category: ActivityCategory) {
    for definition in taxonomy.in_category(category) {
        let _ = writeln!(prompt, "- {} : {}", definition.id, definition.description);
    }
}

pub fn classification_prompt(
    taxonomy: &TaxonomySnapshot,
    scene_description: &str,
    secondary_context: Option<&str>,
) -> String {
    let mut prompt = format!("{CLASSIFICATION_INTRO}\nThe personal categories are:\n");
    list_category(&mut prompt, taxonomy, ActivityCategory::Personal);
    prompt.push_str("The work-related categories are:\n");
    list_category(&mut prompt, taxonomy, ActivityCategory::Work);
    let _ = writeln!(
        prompt,
        "- {IDLE_ACTIVITY_ID} : Nobody is using the computer.\n\n{CLASSIFICATION_RULES}\n\n\
         Answer with the id of exactly one category.\n\n\
         The description of the PRIMARY screen activity is as follows:"
    );
    prompt.push_str(scene_description.trim());
    if let Some(context) = secondary_context.filter(|v| !v.trim().is_empty()) {
        let _ = write!(
            prompt,
            "\n\nAdditional context from other screens:\n{}",
            context.trim()
        );
    }
    prompt
}
