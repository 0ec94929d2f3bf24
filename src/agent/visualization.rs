//! ECharts option for a query result.

use crate::agent::tools::{cell_text, QueryResult};
use chrono::NaiveDate;
use serde_json::{json, Value};

const MAX_POINTS: usize = 50;

/// Bar chart by default, line chart when the category column holds dates.
/// `None` when the result has no category/number shape to plot.
pub fn build_chart(result: &QueryResult, title: &str) -> Option<Value> {
    if result.rows.len() < 2 || result.columns.len() < 2 {
        return None;
    }
    let numeric: Vec<usize> = (0..result.columns.len())
        .filter(|&i| result.rows.iter().all(|row| row.get(i).map_or(false, is_numeric)))
        .collect();
    let category = (0..result.columns.len()).find(|i| !numeric.contains(i))?;
    if numeric.is_empty() {
        return None;
    }

    let rows = &result.rows[..result.rows.len().min(MAX_POINTS)];
    let labels: Vec<String> = rows
        .iter()
        .map(|row| row.get(category).map(cell_text).unwrap_or_default())
        .collect();
    let chart_type = if labels.iter().all(|l| looks_like_date(l)) {
        "line"
    } else {
        "bar"
    };

    let series: Vec<Value> = numeric
        .iter()
        .map(|&i| {
            let data: Vec<Value> = rows.iter().map(|row| row[i].clone()).collect();
            json!({"name": result.columns[i], "type": chart_type, "data": data})
        })
        .collect();

    Some(json!({
        "title": {"text": title},
        "tooltip": {"trigger": "axis"},
        "legend": {"data": numeric.iter().map(|&i| result.columns[i].clone()).collect::<Vec<_>>()},
        "xAxis": {"type": "category", "data": labels},
        "yAxis": {"type": "value"},
        "series": series,
    }))
}

fn is_numeric(value: &Value) -> bool {
    match value {
        Value::Number(_) => true,
        Value::String(s) => s.parse::<f64>().is_ok(),
        _ => false,
    }
}

fn looks_like_date(text: &str) -> bool {
    let head = text.get(..10).unwrap_or(text);
    NaiveDate::parse_from_str(head, "%Y-%m-%d").is_ok()
        || NaiveDate::parse_from_str(&format!("{}-01", text), "%Y-%m-%d").is_ok()
}
