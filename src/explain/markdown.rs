use serde_json::Value;

const HEADER: &str = "| Operation | Table | Rows | Filtered | Cost |\n|---|---|---|---|---|\n";

#[derive(Debug, Default)]
struct PlanRow {
    operation: String,
    table: String,
    rows: String,
    filtered: String,
    cost: String,
}

/// Render a `FORMAT=JSON` plan as a markdown table, one row per accessed table in plan order.
pub fn render(plan: &Value) -> String {
    let mut rows = Vec::new();
    collect_tables(plan, &mut rows);

    let mut out = String::from(HEADER);
    if rows.is_empty() {
        let message = plan
            .pointer("/query_block/message")
            .and_then(Value::as_str)
            .unwrap_or("no table access");
        out.push_str(&format!("| {} | - | - | - | - |\n", escape(message)));
        return out;
    }

    for row in rows {
        out.push_str(&format!(
            "| {} | {} | {} | {} | {} |\n",
            escape(&row.operation),
            escape(&row.table),
            row.rows,
            row.filtered,
            row.cost
        ));
    }
    out
}

fn collect_tables(value: &Value, rows: &mut Vec<PlanRow>) {
    match value {
        Value::Object(map) => {
            if let Some(table) = map.get("table").filter(|t| t.get("table_name").is_some()) {
                rows.push(plan_row(table));
            }
            for (key, child) in map {
                if key != "table" {
                    collect_tables(child, rows);
                } else if let Some(inner) = child.as_object() {
                    // Derived tables nest their own query blocks under the table node.
                    for grandchild in inner.values() {
                        collect_tables(grandchild, rows);
                    }
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|item| collect_tables(item, rows)),
        _ => {}
    }
}

fn plan_row(table: &Value) -> PlanRow {
    PlanRow {
        operation: text(table, "access_type"),
        table: text(table, "table_name"),
        rows: text(table, "rows_examined_per_scan"),
        filtered: text(table, "filtered"),
        cost: table
            .pointer("/cost_info/prefix_cost")
            .or_else(|| table.pointer("/cost_info/read_cost"))
            .map(scalar)
            .unwrap_or_else(|| "-".to_string()),
    }
}

fn text(value: &Value, key: &str) -> String {
    value.get(key).map(scalar).unwrap_or_else(|| "-".to_string())
}

fn scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "-".to_string(),
        other => other.to_string(),
    }
}

fn escape(cell: &str) -> String {
    cell.replace('|', "\\|")
}
