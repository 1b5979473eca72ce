//! Decision prompt construction

use std::fmt::Write as _;

use chrono::Utc;

use super::action::{ActionKind, ActionSet};
use super::state::ResearchContext;
use crate::tokenizer::Tokenizer;

/// Knowledge answers (mostly page text) are cut to this many tokens in the prompt
const MAX_KNOWLEDGE_TOKENS: usize = 2_000;

/// Build the prompt for one decision about `question`
///
/// `beast_mode` adds the best-effort override used for the final forced answer.
pub fn build_prompt(
    ctx: &ResearchContext,
    question: &str,
    permitted: &ActionSet,
    beast_mode: bool,
) -> String {
    let mut prompt = String::new();

    let _ = writeln!(prompt, "Current date: {}\n", Utc::now().format("%a, %d %b %Y %H:%M:%S GMT"));
    let _ = writeln!(
        prompt,
        "You are an advanced AI research agent specialized in multistep reasoning. Using your training data and prior lessons learned, answer the following question with absolute certainty:\n"
    );
    let _ = writeln!(prompt, "<question>\n{}\n</question>\n", question);

    if !ctx.diary().is_empty() {
        prompt.push_str("<context>\nYou have conducted the following actions:\n\n");
        prompt.push_str(&ctx.diary().join("\n\n"));
        prompt.push_str("\n</context>\n\n");
    }

    if !ctx.knowledge().is_empty() {
        prompt.push_str("<knowledge>\nYou have gathered the following knowledge, which might be useful for answering the original question:\n\n");
        let tokenizer = Tokenizer::default();
        for (i, item) in ctx.knowledge().iter().enumerate() {
            let answer = tokenizer.truncate(&item.answer, MAX_KNOWLEDGE_TOKENS);
            let _ = writeln!(
                prompt,
                "<knowledge-{n}>\n<question>\n{q}\n</question>\n<answer>\n{a}\n</answer>\n</knowledge-{n}>",
                n = i + 1,
                q = item.question,
                a = answer
            );
        }
        prompt.push_str("</knowledge>\n\n");
    }

    if !ctx.bad_attempts().is_empty() {
        prompt.push_str("<bad-attempts>\nYou have tried the following answers before and they were rejected. Do not repeat them.\n\n");
        for (i, attempt) in ctx.bad_attempts().iter().enumerate() {
            let _ = writeln!(
                prompt,
                "<attempt-{n}>\n- Question: {q}\n- Answer: {a}\n- Reject Reason: {e}\n- Actions Recap: {r}\n- Actions Blame: {b}\n</attempt-{n}>\n",
                n = i + 1,
                q = attempt.question,
                a = attempt.answer,
                e = attempt.evaluation,
                r = attempt.recap,
                b = attempt.blame
            );
        }
        prompt.push_str("</bad-attempts>\n\n");

        prompt.push_str("<learned-strategy>\n");
        for attempt in ctx.bad_attempts() {
            let _ = writeln!(prompt, "- {}", attempt.improvement);
        }
        prompt.push_str("</learned-strategy>\n\n");
    }

    prompt.push_str("<actions>\nBased on the current context, you must choose one of the following actions:\n\n");
    for kind in permitted.permitted() {
        prompt.push_str(&action_section(ctx, kind));
        prompt.push('\n');
    }
    prompt.push_str("</actions>\n\n");

    if beast_mode {
        prompt.push_str(BEAST_MODE_OVERRIDE);
        prompt.push_str("\n\n");
    }

    prompt.push_str("Think step by step, choose the action, and respond with a single JSON object matching the required schema.");
    prompt
}

const BEAST_MODE_OVERRIDE: &str = "<final-attempt>\nYou are out of time and research budget. This is your final attempt and it must produce an answer.\n- Previous attempts may have been too cautious; uncertainty is acceptable now, silence is not.\n- Use every fragment of knowledge and context above, make the most plausible inference, and commit to a specific answer.\n- Cite references from the knowledge above where possible.\n</final-attempt>";

fn action_section(ctx: &ResearchContext, kind: ActionKind) -> String {
    match kind {
        ActionKind::Visit => {
            let mut urls = String::new();
            for (url, title) in ctx.frontier() {
                let _ = writeln!(urls, "  + \"{}\": \"{}\"", url, title);
            }
            format!(
                "<action-visit>\n- Visit any URLs from below to gather external knowledge, choose the most relevant URLs that might contain the answer\n<url-list>\n{}</url-list>\n- When you have enough search result in the context and want to deep dive into specific URLs\n- It allows you to access the full content behind any URLs\n</action-visit>\n",
                urls
            )
        }
        ActionKind::Search => {
            let mut section = String::from("<action-search>\n- Query external sources using a public search engine\n- Focus on solving one specific aspect of the question\n- Only give keywords search query, not full sentences\n");
            if !ctx.keywords().is_empty() {
                let _ = writeln!(
                    section,
                    "- Avoid these unsuccessful or already used keywords: {}",
                    ctx.keywords().join(", ")
                );
            }
            section.push_str("</action-search>\n");
            section
        }
        ActionKind::Answer => {
            "<action-answer>\n- If <question> is a simple greeting or chit-chat, answer it directly\n- Otherwise provide a definitive answer supported by the knowledge above\n- Include references with exact quotes and URLs when available\n- Never hedge with \"I don't know\" or \"not sure\" unless nothing else is possible\n</action-answer>\n".to_string()
        }
        ActionKind::Reflect => {
            "<action-reflect>\n- Analyze the knowledge gaps between what you know and what the question needs\n- Propose at most 2 clarifying sub-questions, each short, specific and self-contained\n- Do not repeat questions you have already asked\n</action-reflect>\n".to_string()
        }
    }
}
