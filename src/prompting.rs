//! System-prompt construction for the AI responder.
//!
//! Three variants: the per-website agent configuration when one exists, a
//! minimal greeting-only prompt for a bare "hi" opening a conversation, and
//! the default business-context prompt for everything else. All three carry
//! the same fixed policy block; the policy is an instruction to the model,
//! nothing here enforces it mechanically.

use minijinja::{context, Environment};
use regex::Regex;

use crate::types::{HistoryTurn, WebsiteConfig};

const SYSTEM_PROMPT_TEMPLATE: &str = include_str!("prompts/system_prompt.j2");
const GREETING_PROMPT_TEMPLATE: &str = include_str!("prompts/greeting_prompt.j2");
const AGENT_PROMPT_TEMPLATE: &str = include_str!("prompts/agent_prompt.j2");

const TRANSCRIPT_TURN_LIMIT: usize = 14;

pub const POLICY_BLOCK: &str = "Rules that always apply:\n\
- Never ask the visitor for payment details, passwords, or account credentials.\n\
- If the visitor asks for something unrelated to this business, reply with one of: \
\"I'm only able to help with questions about this business.\" or \
\"Let's keep this conversation focused on how I can help you here.\"\n\
- Do not volunteer inventory, pricing, or internal business details unless the visitor asks.";

/// Matches first messages that are nothing but a greeting, so the model is
/// told to greet back instead of volunteering business specifics.
pub fn is_bare_greeting(text: &str) -> bool {
    let Ok(pattern) = Regex::new(
        r"(?i)^\s*(hi|hiya|hello|hey|yo|sup|howdy|greetings|good\s+(morning|afternoon|evening))\s*[!.,]*\s*$",
    ) else {
        return false;
    };
    pattern.is_match(text)
}

pub fn build_system_prompt(website: &WebsiteConfig, first_turn: bool, visitor_text: &str) -> String {
    if let Some(agent) = &website.agent {
        return render(
            "agent_prompt",
            AGENT_PROMPT_TEMPLATE,
            context! {
                agent_name => display_or(&agent.agent_name, "the assistant"),
                tone => agent.tone.trim(),
                website_name => display_or(&website.name, "this website"),
                business_description => website.business_description.trim(),
                custom_instructions => agent.custom_instructions.trim(),
                policy_block => POLICY_BLOCK,
            },
        )
        .unwrap_or_else(|| fallback_agent_prompt(website, agent));
    }

    if first_turn && is_bare_greeting(visitor_text) {
        return render(
            "greeting_prompt",
            GREETING_PROMPT_TEMPLATE,
            context! {
                website_name => display_or(&website.name, "this website"),
                policy_block => POLICY_BLOCK,
            },
        )
        .unwrap_or_else(|| fallback_greeting_prompt(website));
    }

    render(
        "system_prompt",
        SYSTEM_PROMPT_TEMPLATE,
        context! {
            website_name => display_or(&website.name, "this website"),
            business_description => website.business_description.trim(),
            policy_block => POLICY_BLOCK,
        },
    )
    .unwrap_or_else(|| fallback_default_prompt(website))
}

/// Flattened prior turns as "sender: text" lines, newest last.
pub fn transcript_from_history(history: &[HistoryTurn]) -> String {
    let start = history.len().saturating_sub(TRANSCRIPT_TURN_LIMIT);
    history[start..]
        .iter()
        .filter(|turn| !turn.text.trim().is_empty())
        .map(|turn| {
            let sender = if turn.sender.trim().is_empty() {
                "visitor"
            } else {
                turn.sender.trim()
            };
            format!("{}: {}", sender, turn.text.trim())
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn render(name: &str, template: &str, ctx: minijinja::Value) -> Option<String> {
    let mut env = Environment::new();
    env.add_template(name, template).ok()?;
    let template = env.get_template(name).ok()?;
    template.render(ctx).ok()
}

fn display_or<'a>(value: &'a str, default: &'a str) -> &'a str {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        default
    } else {
        trimmed
    }
}

fn fallback_default_prompt(website: &WebsiteConfig) -> String {
    let mut prompt = format!(
        "You are the support assistant for \"{}\".\n",
        display_or(&website.name, "this website")
    );
    if !website.business_description.trim().is_empty() {
        prompt.push_str("About the business:\n");
        prompt.push_str(website.business_description.trim());
        prompt.push('\n');
    }
    prompt.push_str(
        "Answer the visitor's questions accurately and concisely using the business context above.\n\n",
    );
    prompt.push_str(POLICY_BLOCK);
    prompt
}

fn fallback_greeting_prompt(website: &WebsiteConfig) -> String {
    format!(
        "You are the support assistant for \"{}\".\n\
         The visitor has only said hello. Greet them back warmly in one short sentence \
         and ask how you can help. Do not describe the business, its products, or its \
         services unless the visitor asks.\n\n{}",
        display_or(&website.name, "this website"),
        POLICY_BLOCK
    )
}

fn fallback_agent_prompt(website: &WebsiteConfig, agent: &crate::types::AgentConfig) -> String {
    let mut prompt = format!(
        "You are {}, the support assistant for \"{}\".\n",
        display_or(&agent.agent_name, "the assistant"),
        display_or(&website.name, "this website")
    );
    if !agent.tone.trim().is_empty() {
        prompt.push_str(&format!("Tone: {}.\n", agent.tone.trim()));
    }
    if !website.business_description.trim().is_empty() {
        prompt.push_str("About the business:\n");
        prompt.push_str(website.business_description.trim());
        prompt.push('\n');
    }
    if !agent.custom_instructions.trim().is_empty() {
        prompt.push_str("Instructions from the site owner:\n");
        prompt.push_str(agent.custom_instructions.trim());
        prompt.push('\n');
    }
    prompt.push('\n');
    prompt.push_str(POLICY_BLOCK);
    prompt
}
