use cardwall_kernel::Kernel;
use cardwall_protocol::{Error, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    Json,
    Html,
}

impl std::str::FromStr for ExportFormat {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "json" => Ok(ExportFormat::Json),
            "html" => Ok(ExportFormat::Html),
            other => Err(Error::Validation(format!("unknown export format: {other}"))),
        }
    }
}

/// Serialize one run (or all runs) to a file. Reads only; run activity
/// timestamps are untouched. A run with zero cards still yields a valid
/// empty document.
pub fn export(
    kernel: &Kernel,
    path: &Path,
    format: ExportFormat,
    run_label: Option<&str>,
) -> Result<PathBuf> {
    let doc = collect(kernel, run_label)?;
    let body = match format {
        ExportFormat::Json => {
            serde_json::to_string_pretty(&doc).map_err(|e| Error::Storage(e.to_string()))?
        }
        ExportFormat::Html => render_html(&doc),
    };
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| Error::Storage(e.to_string()))?;
        }
    }
    std::fs::write(path, body).map_err(|e| Error::Storage(e.to_string()))?;
    Ok(path.to_path_buf())
}

fn collect(kernel: &Kernel, run_label: Option<&str>) -> Result<Value> {
    let summaries = kernel.list_runs()?;
    let mut runs = Vec::new();
    match run_label {
        Some(label) => {
            let summary = summaries.iter().find(|r| r.label == label);
            runs.push(run_doc(
                kernel,
                label,
                summary.map(|s| (s.created.clone(), s.last_activity.clone())),
            )?);
        }
        None => {
            for s in &summaries {
                runs.push(run_doc(
                    kernel,
                    &s.label,
                    Some((s.created.clone(), s.last_activity.clone())),
                )?);
            }
        }
    }
    Ok(json!({
        "exported": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        "runs": runs,
    }))
}

fn run_doc(kernel: &Kernel, label: &str, meta: Option<(String, String)>) -> Result<Value> {
    let cards = kernel.list_cards(label)?;
    let mut doc = json!({"label": label, "cards": cards});
    if let Some((created, last_activity)) = meta {
        doc["created"] = json!(created);
        doc["last_activity"] = json!(last_activity);
    }
    Ok(doc)
}

/// One self-contained page: embedded data, inline styles, a small
/// renderer. No network fetches needed to view it later.
fn render_html(doc: &Value) -> String {
    let data = serde_json::to_string(doc)
        .unwrap_or_else(|_| "{}".to_string())
        .replace("</", "<\\/");
    format!(
        r#"<!doctype html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>cardwall export</title>
<style>
body {{ font-family: system-ui, sans-serif; margin: 2rem auto; max-width: 60rem; color: #1c1e21; }}
h1 {{ font-size: 1.4rem; }}
h2 {{ font-size: 1.1rem; border-bottom: 1px solid #ddd; padding-bottom: .3rem; margin-top: 2rem; }}
.card {{ border: 1px solid #e3e3e3; border-radius: 6px; padding: 1rem; margin: 1rem 0; }}
.card .meta {{ color: #888; font-size: .8rem; margin-bottom: .5rem; }}
table {{ border-collapse: collapse; width: 100%; }}
th, td {{ border: 1px solid #ddd; padding: .3rem .5rem; text-align: left; font-size: .9rem; }}
pre {{ background: #f6f6f6; padding: .6rem; overflow-x: auto; }}
dl {{ display: grid; grid-template-columns: max-content 1fr; gap: .2rem 1rem; }}
dt {{ font-weight: 600; }}
</style>
</head>
<body>
<h1>cardwall export</h1>
<div id="root"></div>
<script id="data" type="application/json">{data}</script>
<script>
const doc = JSON.parse(document.getElementById("data").textContent);
const root = document.getElementById("root");
const el = (tag, text) => {{ const n = document.createElement(tag); if (text !== undefined) n.textContent = text; return n; }};
for (const run of doc.runs) {{
  root.appendChild(el("h2", "run: " + run.label));
  for (const card of run.cards) {{
    const box = el("div"); box.className = "card";
    const meta = el("div", card.kind + " · " + card.created); meta.className = "meta";
    box.appendChild(meta);
    if (card.title) box.appendChild(el("strong", card.title));
    if (card.description) box.appendChild(el("p", card.description));
    if (card.kind === "table" && card.payload && card.payload.columns) {{
      const t = el("table"); const head = el("tr");
      const names = card.payload.columns.map(c => typeof c === "string" ? c : c.name);
      for (const n of names) head.appendChild(el("th", n));
      t.appendChild(head);
      for (const row of card.payload.rows || []) {{
        const tr = el("tr");
        const cells = Array.isArray(row) ? row : names.map(n => row[n]);
        for (const c of cells) tr.appendChild(el("td", String(c)));
        t.appendChild(tr);
      }}
      box.appendChild(t);
    }} else if (card.kind === "markdown") {{
      const text = typeof card.payload === "string" ? card.payload : (card.payload.text || "");
      box.appendChild(el("pre", text));
    }} else if (card.kind === "key_value") {{
      const dl = el("dl");
      for (const [k, v] of Object.entries(card.payload || {{}})) {{
        dl.appendChild(el("dt", k)); dl.appendChild(el("dd", String(v)));
      }}
      box.appendChild(dl);
    }} else if (card.kind !== "section") {{
      box.appendChild(el("pre", JSON.stringify(card.payload, null, 2)));
    }}
    root.appendChild(box);
  }}
}}
</script>
</body>
</html>
"#
    )
}
