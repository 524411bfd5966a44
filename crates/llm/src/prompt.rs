//! Prompt assembly for generation and judging requests.

use pipeline::ports::{Feedback, GeneratePurpose, GenerateRequest, JudgePurpose, JudgeRequest};
use pipeline::schema::OutputSchema;
use serde_json::{json, Value};

/// A system prompt and a single user message.
#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

const JSON_ONLY: &str = "Respond with a single JSON object and nothing else.";

pub fn generation_prompt(request: &GenerateRequest) -> Prompt {
    let contract = match request.purpose {
        GeneratePurpose::Produce => match &request.output_schema {
            Some(schema) => format!("{JSON_ONLY} {}", describe_schema(schema)),
            None => JSON_ONLY.to_string(),
        },
        GeneratePurpose::Spawn => format!(
            "{JSON_ONLY} It must have the shape {{\"items\": [{{\"title\": string, \"body\": string}}]}}, one entry per work item to create. Return an empty list if nothing should be created."
        ),
    };
    let system = format!("{}\n\n{contract}", request.instructions.trim());

    let mut message = json!({ "input": request.input });
    if let Some(previous) = &request.previous_output {
        message["previous_output"] = previous.clone();
    }
    if !request.feedback.is_empty() {
        message["feedback"] = Value::Array(request.feedback.iter().map(describe_feedback).collect());
    }
    Prompt {
        system,
        user: to_pretty(&message),
    }
}

pub fn judge_prompt(request: &JudgeRequest) -> Prompt {
    let contract = match &request.purpose {
        JudgePurpose::Alignment => format!(
            "{JSON_ONLY} Shape: {{\"score\": number between 0 and 1, \"findings\": [{{\"kind\": \"missing\"|\"extra\"|\"modified\"|\"ambiguous\"|\"scope_exceeded\", \"severity\": \"blocking\"|\"warning\"|\"informational\", \"description\": string, \"input_reference\": string|null, \"output_reference\": string|null, \"remediation\": string|null}}]}}."
        ),
        JudgePurpose::EdgeCondition { .. } => format!(
            "Answer the question below about the node output. {JSON_ONLY} Shape: {{\"verdict\": true|false, \"reason\": string}}."
        ),
    };
    let system = format!("{}\n\n{contract}", request.instructions.trim());
    let user = to_pretty(&json!({
        "input": request.input,
        "output": request.output,
    }));
    Prompt { system, user }
}

fn describe_schema(schema: &OutputSchema) -> String {
    let fields: Vec<String> = schema
        .fields
        .iter()
        .map(|(name, field_type)| {
            let kind = serde_json::to_value(field_type)
                .ok()
                .and_then(|value| value.as_str().map(str::to_string))
                .unwrap_or_else(|| "any".into());
            format!("\"{name}\": {kind}")
        })
        .collect();
    let mut text = format!("Fields: {{{}}}.", fields.join(", "));
    if !schema.required.is_empty() {
        text.push_str(&format!(" Required: {}.", schema.required.join(", ")));
    }
    text
}

fn describe_feedback(feedback: &Feedback) -> Value {
    match feedback {
        Feedback::InvalidOutput { attempt, errors } => json!({
            "problem": "the previous output was invalid",
            "attempt": attempt,
            "errors": errors,
        }),
        Feedback::Misaligned { rework, findings } => json!({
            "problem": "the previous output did not match the input",
            "rework": rework,
            "findings": findings,
        }),
        Feedback::ReworkRequested { edge, from, output } => json!({
            "problem": format!("'{from}' sent the work back through '{edge}'"),
            "review": output,
        }),
    }
}

fn to_pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline::schema::FieldType;
    use pipeline::{NodeId, PipelineRunId, TokenCost};
    use std::collections::BTreeMap;

    fn request(purpose: GeneratePurpose) -> GenerateRequest {
        GenerateRequest {
            run_id: PipelineRunId::new_random(),
            node: NodeId::new("review").expect("non-empty"),
            purpose,
            instructions: "Review the change.".into(),
            input: json!({"code_generation": {"diff": "+fn retry()"}}),
            feedback: vec![Feedback::InvalidOutput {
                attempt: 1,
                errors: vec!["missing field 'approved'".into()],
            }],
            previous_output: None,
            output_schema: Some(OutputSchema {
                required: vec!["approved".into()],
                fields: BTreeMap::from([("approved".to_string(), FieldType::Boolean)]),
            }),
            cost_ceiling: TokenCost::zero(),
        }
    }

    #[test]
    fn generation_prompt_with_schema_expected_contract_and_feedback() {
        let prompt = generation_prompt(&request(GeneratePurpose::Produce));
        assert!(prompt.system.starts_with("Review the change."));
        assert!(prompt.system.contains("\"approved\": boolean"));
        assert!(prompt.system.contains("Required: approved."));
        assert!(prompt.user.contains("missing field 'approved'"));
    }

    #[test]
    fn generation_prompt_spawn_expected_items_contract() {
        let prompt = generation_prompt(&request(GeneratePurpose::Spawn));
        assert!(prompt.system.contains("\"items\""));
        assert!(!prompt.system.contains("Required:"));
    }
}
