use clause_core::document::{CellKind, KnowledgeDocument};

/// Render a document as a SWISH notebook (`.swinb`).
///
/// Background cells become background `program` cells, so SWISH loads them
/// for every query in the notebook; query cells keep their goal text; notes
/// become markdown. Cells of unknown kind are skipped.
pub fn render_swinb(doc: &KnowledgeDocument) -> String {
    let mut out = String::from("<div class=\"notebook\">\n");
    for cell in &doc.cells {
        let (class, attrs, body) = match &cell.kind {
            CellKind::Background => (
                "program",
                " data-background=\"true\"",
                cell.content.trim_end().to_owned(),
            ),
            CellKind::Query => ("query", "", terminate(&cell.content)),
            CellKind::Note => ("markdown", "", cell.content.trim_end().to_owned()),
            CellKind::Other(_) => continue,
        };
        out.push_str(&format!(
            "\n<div class=\"nb-cell {class}\"{attrs} name=\"{}\">\n{}\n</div>\n",
            escape(&cell.name),
            escape(&body)
        ));
    }
    out.push_str("\n</div>\n");
    out
}

/// Query cells are stored without the full stop; SWISH expects one.
fn terminate(query: &str) -> String {
    let q = query.trim_end();
    if q.ends_with('.') {
        q.to_owned()
    } else {
        format!("{q}.")
    }
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
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
