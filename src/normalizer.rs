// 响应归一化：把 webhook 返回的任意 JSON 形态压成单条可展示文本。
//
// 不同工作流端点的返回结构互不兼容（纯字符串 / 对象 / 数组 / 空），
// 这里按固定优先级探测字段，保证对同一输入的输出稳定。
use serde_json::{Map, Value};

/// 端点返回为空时的占位文案。
pub const NO_CONTENT_PLACEHOLDER: &str = "no content received";
/// 端点返回空数组时的占位文案。
pub const NO_DATA_PLACEHOLDER: &str = "no data returned";
/// 无法识别的返回形态。
pub const UNRECOGNIZED_PLACEHOLDER: &str = "unrecognized format";
/// 序列化失败时的兜底文案，归一化永不抛错。
pub const RENDER_FAILED_PLACEHOLDER: &str = "response could not be rendered";

/// 字段探测顺序，先命中先用，顺序即兼容性约定。
const CANDIDATE_FIELDS: &[&str] = &["output", "response", "content", "text", "message", "result"];

/// 解码后的响应形态，归一化逻辑对其做穷尽匹配。
#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePayload {
    Absent,
    Text(String),
    List(Vec<Value>),
    Object(Map<String, Value>),
    Other(Value),
}

impl From<Option<Value>> for ResponsePayload {
    fn from(value: Option<Value>) -> Self {
        match value {
            None | Some(Value::Null) => ResponsePayload::Absent,
            Some(Value::String(text)) => ResponsePayload::Text(text),
            Some(Value::Array(items)) => ResponsePayload::List(items),
            Some(Value::Object(map)) => ResponsePayload::Object(map),
            Some(other) => ResponsePayload::Other(other),
        }
    }
}

/// 纯函数、全函数：任意输入都返回一个字符串，无 I/O、无副作用。
pub fn normalize(payload: ResponsePayload) -> String {
    match payload {
        ResponsePayload::Absent => NO_CONTENT_PLACEHOLDER.to_string(),
        ResponsePayload::Text(text) => text,
        ResponsePayload::List(items) => normalize_list(&items),
        ResponsePayload::Object(map) => normalize_object(&map),
        ResponsePayload::Other(_) => UNRECOGNIZED_PLACEHOLDER.to_string(),
    }
}

/// 从原始解码结果归一化。
pub fn normalize_value(value: Option<Value>) -> String {
    normalize(ResponsePayload::from(value))
}

fn normalize_list(items: &[Value]) -> String {
    if items.is_empty() {
        return NO_DATA_PLACEHOLDER.to_string();
    }
    if let Value::Object(first) = &items[0] {
        if let Some(found) = probe_candidates(first) {
            return match found {
                Value::String(text) => text.clone(),
                structured => compact_json(structured),
            };
        }
    }
    // 首元素非对象或字段未命中：逐元素字符串化后按行拼接。
    items
        .iter()
        .map(stringify_element)
        .collect::<Vec<_>>()
        .join("\n")
}

fn normalize_object(map: &Map<String, Value>) -> String {
    if let Some(found) = probe_candidates(map) {
        return match found {
            Value::String(text) => text.clone(),
            structured => pretty_json(structured),
        };
    }
    pretty_json(&Value::Object(map.clone()))
}

fn probe_candidates<'a>(map: &'a Map<String, Value>) -> Option<&'a Value> {
    for field in CANDIDATE_FIELDS {
        if let Some(value) = map.get(*field) {
            if !value.is_null() {
                return Some(value);
            }
        }
    }
    None
}

fn stringify_element(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => "null".to_string(),
        other => compact_json(other),
    }
}

fn compact_json(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| RENDER_FAILED_PLACEHOLDER.to_string())
}

fn pretty_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| RENDER_FAILED_PLACEHOLDER.to_string())
}
