//! 把原始 JSON 文档渲染成只含所选字段的粗体键 markdown。

use serde_json::{Map, Value};

const INDENT: &str = "  ";

/// 顶层键按所选列过滤并保持源顺序；列为空时保留全部键
pub fn render_markdown(source: &Value, columns: &[String]) -> String {
    match source {
        Value::Object(map) => render_object(map, Some(columns), 0),
        other => render_value(other, 0),
    }
}

fn render_object(map: &Map<String, Value>, columns: Option<&[String]>, depth: usize) -> String {
    let indent = INDENT.repeat(depth);
    let lines: Vec<String> = map
        .iter()
        .filter(|(key, _)| match columns {
            Some(cols) if !cols.is_empty() => cols.iter().any(|c| c == *key),
            _ => true,
        })
        .map(|(key, value)| {
            let rendered = render_value(value, depth + 1);
            if is_block(value) {
                format!("{}**{}:**\n{}", indent, key, rendered)
            } else {
                format!("{}**{}:** {}", indent, key, rendered)
            }
        })
        .collect();

    if lines.is_empty() {
        return format!("{}{{}}", indent);
    }
    lines.join("\n")
}

/// 非空数组与非空对象另起一行渲染
fn is_block(value: &Value) -> bool {
    match value {
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
        _ => false,
    }
}

fn render_value(value: &Value, depth: usize) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        Value::Array(items) if items.is_empty() => "[]".to_string(),
        Value::Array(items) => {
            let indent = INDENT.repeat(depth);
            items
                .iter()
                .map(|item| {
                    if is_block(item) {
                        format!("{}-\n{}", indent, render_value(item, depth + 1))
                    } else {
                        format!("{}- {}", indent, render_value(item, depth + 1))
                    }
                })
                .collect::<Vec<_>>()
                .join("\n")
        }
        Value::Object(map) if map.is_empty() => "{}".to_string(),
        Value::Object(map) => render_object(map, None, depth),
    }
}
