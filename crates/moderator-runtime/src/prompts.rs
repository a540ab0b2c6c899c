//! Judge prompts.
//!
//! A prompt is assembled in a fixed order so identical inputs always give
//! byte-identical prompts:
//! 1. Base judge instructions and output schema
//! 2. Community lore
//! 3. Conversation context, when supplied
//! 4. The criterion, with placeholders substituted
//! 5. The comment under review

use lazy_static::lazy_static;
use regex::{Captures, Regex};

use moderator_core::{EvaluationContext, RubricNode};

lazy_static! {
    static ref PLACEHOLDER: Regex =
        Regex::new(r"\{\{(node_id|lore|context|comment)\}\}").unwrap();
}

/// Instructions shared by every criterion.
pub const BASE_JUDGE_PROMPT: &str = r#"
You are a moderation judge for an online community.

You score ONE comment against ONE criterion. You do not judge the comment
as a whole and you do not invent criteria of your own. Use the community
lore to understand local norms and vocabulary.

## Output Format (JSON only)
{
  "base_score": 0.0-1.0,
  "substance_level": "low" | "medium" | "high",
  "multiplier": number > 0 (optional),
  "final_score": 0.0-1.0 (optional),
  "decision": "APPROVE" | "REJECT" | "NEEDS_REVIEW" (optional)
}

## Scoring Guidelines
- base_score 1.0: the comment fully satisfies the criterion
- base_score 0.5: mixed or unclear
- base_score 0.0: the comment clearly fails the criterion
- substance_level: how much the comment adds to the discussion
- Omit multiplier unless the criterion tells you to adjust it

Respond with the JSON object and nothing else.
"#;

const COMMENT_OPEN: &str = "<<<COMMENT";
const COMMENT_CLOSE: &str = "COMMENT>>>";

/// Substitute `{{comment}}`, `{{lore}}`, `{{context}}` and `{{node_id}}`.
///
/// Substitution is a single pass over the template: placeholders inside
/// substituted text are not expanded again. Unknown placeholders are left
/// as written.
pub fn render_template(template: &str, node_id: &str, ctx: &EvaluationContext) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures| match &caps[1] {
            "node_id" => node_id.to_string(),
            "lore" => ctx.lore().to_string(),
            "context" => ctx.conversation.clone().unwrap_or_default(),
            "comment" => ctx.comment.clone(),
            _ => caps[0].to_string(),
        })
        .into_owned()
}

/// Full prompt for evaluating `node` within `ctx`.
pub fn build_prompt(node: &RubricNode, ctx: &EvaluationContext) -> String {
    let mut prompt = String::with_capacity(
        BASE_JUDGE_PROMPT.len() + ctx.lore().len() + ctx.comment.len() + node.prompt().len() + 256,
    );

    prompt.push_str(BASE_JUDGE_PROMPT.trim_start());

    prompt.push_str("\n## Community Lore\n");
    if ctx.lore().trim().is_empty() {
        prompt.push_str("(none provided)\n");
    } else {
        prompt.push_str(ctx.lore().trim_end());
        prompt.push('\n');
    }

    if let Some(conversation) = ctx.conversation.as_deref() {
        prompt.push_str("\n## Conversation Context\n");
        prompt.push_str(conversation.trim_end());
        prompt.push('\n');
    }

    prompt.push_str(&format!("\n## Criterion `{}`\n", node.id));
    prompt.push_str(render_template(node.prompt(), &node.id, ctx).trim_end());
    prompt.push('\n');

    prompt.push_str("\n## Comment Under Review\n");
    prompt.push_str(COMMENT_OPEN);
    prompt.push('\n');
    prompt.push_str(&ctx.comment);
    prompt.push('\n');
    prompt.push_str(COMMENT_CLOSE);
    prompt.push('\n');

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use moderator_core::load;
    use std::sync::Arc;

    const RUBRIC: &str = r#"
root:
  kind: group
  children:
    - kind: task
      id: civility
      prompt: "Criterion {{node_id}}: is this civil? Reply in context of {{context}}."
    - kind: task
      id: relevance
      prompt: "Is the comment on topic?"
"#;

    fn context(conversation: Option<&str>) -> EvaluationContext {
        let tree = Arc::new(load(RUBRIC, "Members are called growers.").unwrap());
        let ctx = EvaluationContext::new("Lovely basil, grower!", tree);
        match conversation {
            Some(text) => ctx.with_conversation(text),
            None => ctx,
        }
    }

    #[test]
    fn test_prompt_sections_in_order() {
        let ctx = context(Some("OP: my basil photo"));
        let node = ctx.tree.leaves().next().unwrap().clone();
        let prompt = build_prompt(&node, &ctx);

        let lore = prompt.find("## Community Lore").unwrap();
        let conversation = prompt.find("## Conversation Context").unwrap();
        let criterion = prompt.find("## Criterion `civility`").unwrap();
        let comment = prompt.find("## Comment Under Review").unwrap();
        assert!(lore < conversation && conversation < criterion && criterion < comment);

        assert!(prompt.contains("Members are called growers."));
        assert!(prompt.contains("Criterion civility: is this civil?"));
        assert!(prompt.contains("in context of OP: my basil photo."));
        assert!(prompt.contains("<<<COMMENT\nLovely basil, grower!\nCOMMENT>>>"));
    }

    #[test]
    fn test_prompt_without_conversation() {
        let ctx = context(None);
        let node = ctx.tree.leaves().nth(1).unwrap().clone();
        let prompt = build_prompt(&node, &ctx);

        assert!(!prompt.contains("## Conversation Context"));
        assert!(prompt.contains("Is the comment on topic?"));
        assert!(prompt.contains("Lovely basil, grower!"));
    }

    #[test]
    fn test_prompt_is_deterministic() {
        let ctx = context(Some("thread"));
        let node = ctx.tree.leaves().next().unwrap().clone();
        assert_eq!(build_prompt(&node, &ctx), build_prompt(&node, &ctx));
    }

    #[test]
    fn test_render_template_leaves_unknown_placeholders() {
        let ctx = context(None);
        let rendered = render_template("{{comment}} / {{author}} / {{context}}.", "x", &ctx);
        assert_eq!(rendered, "Lovely basil, grower! / {{author}} / .");
    }

    #[test]
    fn test_render_template_does_not_expand_substituted_text() {
        let tree = Arc::new(load(RUBRIC, "Quote {{comment}} when replying.").unwrap());
        let ctx = EvaluationContext::new("a {{context}} b", tree).with_conversation("{{lore}}");

        let rendered = render_template("[{{lore}}] [{{context}}] [{{comment}}]", "x", &ctx);
        assert_eq!(
            rendered,
            "[Quote {{comment}} when replying.] [{{lore}}] [a {{context}} b]"
        );
    }
}
