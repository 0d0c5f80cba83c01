use axum::extract::State;
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use serde_json::Value;
use std::fmt::Write;

use crate::error::AppResult;
use crate::ingest::RECEIVED_AT_FIELD;
use crate::routes::history::latest_records;
use crate::state::AppState;
use crate::store::Record;

const COLUMNS: &[(&str, &str)] = &[
    (RECEIVED_AT_FIELD, "Received"),
    ("device_id", "Device"),
    ("device_type", "Type"),
    ("value", "Value"),
    ("unit", "Unit"),
    ("location", "Location"),
    ("timestamp", "Sensor time"),
];

pub(crate) async fn dashboard_handler(State(state): State<AppState>) -> AppResult<Html<String>> {
    let records = latest_records(&state).await?;
    Ok(Html(render_dashboard(&records)))
}

pub fn render_dashboard(records: &[Record]) -> String {
    let mut html = String::from(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>IoT readings</title>\n\
         <style>body{font-family:sans-serif;margin:2em}table{border-collapse:collapse}\
         th,td{border:1px solid #ccc;padding:4px 8px;text-align:left}th{background:#eee}</style>\n\
         </head>\n<body>\n<h1>Latest readings</h1>\n",
    );

    if records.is_empty() {
        html.push_str("<p>No readings stored yet.</p>\n");
    } else {
        html.push_str("<table>\n<thead><tr>");
        for (_, title) in COLUMNS {
            let _ = write!(html, "<th>{title}</th>");
        }
        html.push_str("</tr></thead>\n<tbody>\n");
        for record in records {
            html.push_str("<tr>");
            for (field, _) in COLUMNS {
                let cell = record.get(*field).map(cell_text).unwrap_or_default();
                let _ = write!(html, "<td>{}</td>", escape_html(&cell));
            }
            html.push_str("</tr>\n");
        }
        html.push_str("</tbody>\n</table>\n");
    }

    html.push_str("</body>\n</html>\n");
    html
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

pub fn router() -> Router<AppState> {
    Router::new().route("/dashboard", get(dashboard_handler))
}
