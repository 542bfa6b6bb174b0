//! Tools offered to the model in PLANNING and CODING

use serde_json::json;
use troupe_agent::ToolSpec;

pub const SHELL: &str = "shell";
pub const SUBMIT_PLAN: &str = "submit_plan";
pub const ASK_QUESTION: &str = "ask_question";
pub const MARK_COMPLETE: &str = "mark_complete";
pub const DONE: &str = "done";

fn shell(read_only: bool) -> ToolSpec {
    let description = if read_only {
        "Run a read-only shell command in the story container"
    } else {
        "Run a shell command in the story container"
    };
    ToolSpec::new(
        SHELL,
        description,
        json!({
            "type": "object",
            "properties": {"command": {"type": "string"}},
            "required": ["command"]
        }),
    )
}

fn ask_question() -> ToolSpec {
    ToolSpec::new(
        ASK_QUESTION,
        "Ask the architect a question and wait for the answer",
        json!({
            "type": "object",
            "properties": {
                "question": {"type": "string"},
                "context": {"type": "string"},
                "urgency": {"type": "string", "enum": ["low", "medium", "high"]}
            },
            "required": ["question"]
        }),
    )
}

pub fn planning_tools() -> Vec<ToolSpec> {
    vec![
        shell(true),
        ToolSpec::new(
            SUBMIT_PLAN,
            "Submit an implementation plan for architect approval",
            json!({
                "type": "object",
                "properties": {
                    "plan": {"type": "string"},
                    "confidence": {"type": "string", "enum": ["low", "medium", "high"]},
                    "risks": {"type": "string"}
                },
                "required": ["plan"]
            }),
        ),
        ask_question(),
        ToolSpec::new(
            MARK_COMPLETE,
            "Report that the story is already implemented",
            json!({
                "type": "object",
                "properties": {
                    "summary": {"type": "string"},
                    "evidence": {"type": "string"},
                    "confidence": {"type": "string", "enum": ["low", "medium", "high"]}
                },
                "required": ["summary", "evidence"]
            }),
        ),
    ]
}

pub fn coding_tools() -> Vec<ToolSpec> {
    vec![
        shell(false),
        ask_question(),
        ToolSpec::new(
            DONE,
            "Finish implementation and hand over to testing",
            json!({
                "type": "object",
                "properties": {"summary": {"type": "string"}},
                "required": ["summary"]
            }),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_sets() {
        let planning: Vec<_> = planning_tools().into_iter().map(|t| t.name).collect();
        assert_eq!(planning, vec![SHELL, SUBMIT_PLAN, ASK_QUESTION, MARK_COMPLETE]);

        let coding: Vec<_> = coding_tools().into_iter().map(|t| t.name).collect();
        assert_eq!(coding, vec![SHELL, ASK_QUESTION, DONE]);
    }
}
