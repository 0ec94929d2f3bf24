//! Agent Prompts - system prompts for planning, query generation and answers

use crate::agent::planner::ExecutionPlan;
use crate::agent::tools::QueryResult;
use crate::llm::ChatMessage;
use crate::semantic::SemanticContext;

/// System prompt for the planning step.
pub const PLANNER_SYSTEM_PROMPT: &str = r#"You are the planning stage of a data analysis assistant.

## Your Role

Decide how to answer a business question with one read-only SQL query over the schema you are given, and how sure you are that the question is clear enough to do so.

## Output

Reply with a single JSON object and nothing else:

{
  "steps": [{"kind": "<STEP>", "description": "<one line>"}],
  "confidence": <number between 0 and 1>,
  "reasoning": "<one or two sentences>",
  "ambiguity": "<TIME_RANGE | ENTITY | METRIC | COMPARISON | AGGREGATION | null>"
}

STEP is one of UNDERSTAND, CONTEXT, SEMANTIC, GENERATE, VALIDATE, EXECUTE, ANALYZE, VISUALIZE.

## Confidence

- High (>= 0.8): the metric, filters and time range are all clear from the question and the resolved terms.
- Medium (0.6 - 0.8): small gaps you can fill with obvious defaults.
- Low (< 0.6): you would have to guess the metric, the entity or the time range. Name what is unclear in "ambiguity".
"#;

/// System prompt for SQL generation.
pub const GENERATOR_SYSTEM_PROMPT: &str = r#"You are the SQL generation stage of a data analysis assistant.

## Rules

1. Produce exactly one read-only statement starting with SELECT or WITH.
2. Use only the tables, columns and expressions listed in the schema.
3. Prefer the resolved measures and filters exactly as given; they come from the business glossary.
4. Use the join path when one is given.
5. Never modify data. Every query is checked by a security gate and anything that is not read-only is rejected.

## Output

Reply with the SQL only, optionally inside a ```sql code block. No explanation.
"#;

/// System prompt for the final answer.
pub const ANSWER_SYSTEM_PROMPT: &str = r#"You are the answering stage of a data analysis assistant.

Explain the query result to a business user in the language of their question. Use only numbers that appear in the result; never estimate or invent values. Keep it short: the direct answer first, then at most three observations.
"#;

pub fn planning_messages(question: &str, context: &SemanticContext) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(PLANNER_SYSTEM_PROMPT),
        ChatMessage::user(format!(
            "Question: {}\n\n{}",
            question,
            context.render()
        )),
    ]
}

pub fn generation_messages(
    question: &str,
    plan: &ExecutionPlan,
    context: &SemanticContext,
    repair_instruction: Option<&str>,
) -> Vec<ChatMessage> {
    let mut user = format!(
        "Question: {}\n\n{}\n{}\n",
        question,
        plan.summary(),
        context.render()
    );
    if let Some(instruction) = repair_instruction {
        user.push('\n');
        user.push_str(instruction);
    }
    vec![ChatMessage::system(GENERATOR_SYSTEM_PROMPT), ChatMessage::user(user)]
}

pub fn answer_messages(question: &str, sql: &str, result: &QueryResult) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(ANSWER_SYSTEM_PROMPT),
        ChatMessage::user(format!(
            "Question: {}\n\nQuery:\n{}\n\nResult ({}):\n{}",
            question,
            sql,
            result.summary(),
            result.to_markdown(50)
        )),
    ]
}

/// Pull the SQL out of a generation reply.
pub fn extract_sql(reply: &str) -> String {
    let text = reply.trim();
    let body = match text.find("```") {
        Some(start) => {
            let after = &text[start + 3..];
            // Skip the language tag on the fence line.
            let after = match after.find('\n') {
                Some(nl) if !after[..nl].trim().contains(' ') => &after[nl + 1..],
                _ => after,
            };
            match after.find("```") {
                Some(end) => &after[..end],
                None => after,
            }
        }
        None => text,
    };
    body.trim().trim_end_matches(';').trim().to_string()
}
