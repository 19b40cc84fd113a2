use super::types::{BusinessContext, StageContext};
use crate::pipeline::generation::{PromptFrame, Stage};

const INSTRUCTION_OPEN: &str = "<s>[INST] ";
const INSTRUCTION_CLOSE: &str = "[/INST]";

const JSON_ONLY: &str = "\n\nCRITICAL INSTRUCTIONS\n\
You MUST respond with PURE JSON ONLY.\n\
1. First character MUST be: {\n\
2. Last character MUST be: }\n\
3. NO preamble text allowed (no 'Based on...', 'Here is...', etc.)\n\
4. NO explanations before or after JSON\n\
5. NO markdown code blocks\n\
START IMMEDIATELY with opening brace.\n\n";

const JSON_ONLY_STRICT: &str = "\n\nABSOLUTE REQUIREMENT\n\
You MUST respond with PURE JSON ONLY.\n\
FORBIDDEN:\n\
- Any text before the opening { brace\n\
- Any text after the closing } brace\n\
- Phrases like 'Based on', 'Here is', 'Sure', etc.\n\
- Markdown formatting or code blocks\n\
- Any explanations\n\
REQUIRED:\n\
- Start with the { character\n\
- End with the } character\n\
- Valid JSON syntax only\n\
Generate JSON immediately:\n\n";

/// How hard the instructions push for bare JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enforcement {
    Standard,
    /// Used by the greedy retry.
    Strict,
}

/// Instruction framing around the caller's prompt body.
pub fn frame_for(stage: Stage, context: &StageContext, enforcement: Enforcement) -> PromptFrame {
    let mut prefix = String::from(INSTRUCTION_OPEN);
    if let Some(business) = &context.business {
        prefix.push_str(&business_block(business));
    }
    if stage == Stage::FieldMapping {
        let target = if context.is_batch() {
            Some(format!("Target actions: {}", context.batch_actions.join(", ")))
        } else {
            context.target_action().map(|action| format!("Target action: {action}"))
        };
        if let Some(target) = target {
            prefix.push_str(&target);
            if let Some(software) = context.target_software() {
                prefix.push_str(&format!(" ({software})"));
            }
            prefix.push_str("\n\n");
        }
    }

    let rules = match enforcement {
        Enforcement::Standard => JSON_ONLY,
        Enforcement::Strict => JSON_ONLY_STRICT,
    };
    PromptFrame::new(prefix, format!("{rules}{INSTRUCTION_CLOSE}"))
}

fn business_block(business: &BusinessContext) -> String {
    let mut lines = vec!["Business context:".to_string()];
    if let Some(sector) = &business.sector {
        lines.push(format!("- Sector: {sector}"));
    }
    if let Some(software) = &business.accounting_software {
        lines.push(format!("- Accounting software: {software}"));
    }
    if !business.thresholds.is_empty() {
        let thresholds = serde_json::Value::Object(business.thresholds.clone());
        lines.push(format!("- Thresholds: {thresholds}"));
    }
    if lines.len() == 1 {
        return String::new();
    }
    format!("{}\n\n", lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn frame_wraps_in_instruction_tags() {
        let frame = frame_for(Stage::ActionSelection, &StageContext::default(), Enforcement::Standard);
        assert_eq!(frame.prefix, "<s>[INST] ");
        assert!(frame.suffix.contains("PURE JSON ONLY"));
        assert!(frame.suffix.ends_with("[/INST]"));
    }

    #[test]
    fn strict_frame_differs_from_standard() {
        let context = StageContext::default();
        let standard = frame_for(Stage::FieldMapping, &context, Enforcement::Standard);
        let strict = frame_for(Stage::FieldMapping, &context, Enforcement::Strict);
        assert_ne!(standard.suffix, strict.suffix);
        assert!(strict.suffix.contains("FORBIDDEN"));
    }

    #[test]
    fn business_context_and_target_are_rendered() {
        let mut thresholds = serde_json::Map::new();
        thresholds.insert("auto_approve_below".into(), json!(500));
        let context = StageContext {
            business: Some(BusinessContext {
                sector: Some("construction".into()),
                accounting_software: Some("acme_books".into()),
                thresholds,
            }),
            action_name: Some("create_bill".into()),
            ..Default::default()
        };

        let frame = frame_for(Stage::FieldMapping, &context, Enforcement::Standard);

        assert!(frame.prefix.contains("- Sector: construction"));
        assert!(frame.prefix.contains("\"auto_approve_below\":500"));
        assert!(frame.prefix.contains("Target action: create_bill (acme_books)"));
    }

    #[test]
    fn batch_targets_list_every_action() {
        let context = StageContext {
            software: Some("acme_books".into()),
            batch_actions: vec!["create_contact".into(), "create_bill".into()],
            ..Default::default()
        };
        let frame = frame_for(Stage::FieldMapping, &context, Enforcement::Standard);
        assert!(frame
            .prefix
            .contains("Target actions: create_contact, create_bill (acme_books)"));
        assert!(!frame.prefix.contains("Target action:"));
    }

    #[test]
    fn empty_business_context_adds_nothing() {
        let context = StageContext {
            business: Some(BusinessContext::default()),
            ..Default::default()
        };
        let frame = frame_for(Stage::ActionSelection, &context, Enforcement::Standard);
        assert_eq!(frame.prefix, "<s>[INST] ");
    }
}
