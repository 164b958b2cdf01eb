//! 候选计划与 planning brain 输出解析
//!
//! brain 的输出被当作不可靠的自由文本：先提取 JSON（```json 代码块或裸 JSON），
//! 再按几种常见形状解析；无法解析的候选记录日志后跳过。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::PlannerError;
use crate::plan::ActionContract;

/// 一个候选分解
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanCandidate {
    #[serde(default)]
    pub label: String,
    pub steps: Vec<ActionContract>,
}

impl PlanCandidate {
    pub fn new(label: impl Into<String>, steps: Vec<ActionContract>) -> Self {
        Self {
            label: label.into(),
            steps,
        }
    }
}

/// 从文本中提取 JSON 片段
fn extract_json(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    let obj = trimmed.find('{');
    let arr = trimmed.find('[');
    let (start, close) = match (obj, arr) {
        (Some(o), Some(a)) if a < o => (a, ']'),
        (Some(o), _) => (o, '}'),
        (None, Some(a)) => (a, ']'),
        (None, None) => return None,
    };
    let end = trimmed.rfind(close)?;
    (end > start).then(|| &trimmed[start..=end])
}

fn parse_steps(value: &Value) -> Option<Vec<ActionContract>> {
    let items = value.as_array()?;
    let mut steps = Vec::with_capacity(items.len());
    for item in items {
        match serde_json::from_value::<ActionContract>(item.clone()) {
            Ok(mut step) => {
                // 新提案中的 revision 由 Planner 决定
                step.revision = 0;
                steps.push(step);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Skipping candidate with malformed step");
                return None;
            }
        }
    }
    Some(steps)
}

fn parse_candidate(value: &Value, index: usize) -> Option<PlanCandidate> {
    let label = value
        .get("label")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("candidate-{}", index + 1));
    let steps = match value {
        Value::Array(_) => parse_steps(value)?,
        _ => parse_steps(value.get("steps")?)?,
    };
    Some(PlanCandidate { label, steps })
}

/// 解析 brain 输出为候选列表
///
/// 支持 `{"candidates":[...]}`、`{"steps":[...]}` 与裸步骤数组三种形状。
pub fn parse_proposal(text: &str) -> Result<Vec<PlanCandidate>, PlannerError> {
    let json = extract_json(text)
        .ok_or_else(|| PlannerError::InvalidProposal("no JSON found in response".into()))?;
    let value: Value = serde_json::from_str(json)
        .map_err(|e| PlannerError::InvalidProposal(format!("{}: {}", e, json)))?;

    let raw: Vec<&Value> = if let Some(list) = value.get("candidates").and_then(Value::as_array) {
        list.iter().collect()
    } else if value.get("steps").is_some() {
        vec![&value]
    } else if let Some(list) = value.as_array() {
        if list.iter().any(|v| v.get("steps").is_some()) {
            list.iter().collect()
        } else {
            vec![&value]
        }
    } else {
        return Err(PlannerError::InvalidProposal(
            "expected candidates, steps or an array of steps".into(),
        ));
    };

    let candidates: Vec<PlanCandidate> = raw
        .into_iter()
        .enumerate()
        .filter_map(|(i, v)| parse_candidate(v, i))
        .filter(|c| !c.steps.is_empty())
        .collect();
    if candidates.is_empty() {
        return Err(PlannerError::NoCandidates);
    }
    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fenced_candidates() {
        let text = r#"Here you go:
```json
{"candidates": [
  {"label": "fast", "steps": [{"id": "a", "capability": "echo"}]},
  {"label": "thorough", "steps": [{"id": "a", "capability": "echo"}, {"id": "b", "capability": "echo", "depends_on": ["a"]}]}
]}
```"#;
        let candidates = parse_proposal(text).unwrap();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].label, "fast");
        assert_eq!(candidates[1].steps[1].depends_on, vec!["a"]);
    }

    #[test]
    fn test_parse_bare_steps_object_and_array() {
        let single = parse_proposal(r#"{"steps": [{"id": "a", "capability": "echo"}]}"#).unwrap();
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].label, "candidate-1");

        let array = parse_proposal(r#"[{"id": "a", "capability": "echo", "revision": 4}]"#).unwrap();
        assert_eq!(array[0].steps[0].revision, 0);
    }

    #[test]
    fn test_malformed_candidate_skipped() {
        let text = r#"{"candidates": [{"steps": [{"id": "a"}]}, {"steps": [{"id": "b", "capability": "echo"}]}]}"#;
        let candidates = parse_proposal(text).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].steps[0].id, "b");
    }

    #[test]
    fn test_no_json_is_invalid() {
        assert!(matches!(
            parse_proposal("I cannot help with that."),
            Err(PlannerError::InvalidProposal(_))
        ));
        assert_eq!(
            parse_proposal(r#"{"candidates": []}"#).unwrap_err(),
            PlannerError::NoCandidates
        );
    }
}
