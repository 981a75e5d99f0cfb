//! HTML documentation of the generated fact tables.

use crate::dynamic_table::{DocRow, DynamicTable};

const TEMPLATE: &str = include_str!("../templates/table_documentation.html");

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

/// One `<table>` element listing `rows`.
pub fn table_html(caption: &str, rows: &[DocRow]) -> String {
    let mut out = format!(
        "<table><caption>{}</caption><thead><tr><th>Column Name</th><th>Description</th><th>Units</th><th>Per</th><th>Type</th></tr></thead><tbody>\n",
        escape_html(caption)
    );
    for row in rows {
        out.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>\n",
            escape_html(&row.name),
            escape_html(&row.comments),
            escape_html(&row.unit),
            escape_html(&row.per),
            row.kind
        ));
    }
    out.push_str("</tbody></table>");
    out
}

/// A complete page documenting `table` in `database`.
pub fn table_documentation(database: &str, table: &DynamicTable) -> String {
    let caption = format!("Documentation for table `{database}`.`{}`", table.name);
    TEMPLATE.replacen("__TABLE__", &table_html(&caption, &table.documentation()), 1)
}
