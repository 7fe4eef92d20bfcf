//! Painless merge scripts applied by scripted upserts.
//!
//! Each script folds one module finding into the per-target document and
//! dedups by a domain key, so re-indexing the same finding is a no-op.
//! [`MergeScript::apply`] is the in-process equivalent used by the memory
//! index.

use serde_json::{Map, Value};

const PORTS_SCRIPT: &str = r#"
if (ctx._source.ports == null) {
  ctx._source.ports = new ArrayList();
}
boolean present = false;
for (def existing : ctx._source.ports) {
  if (existing.port == params.port.port) {
    present = true;
    break;
  }
}
if (!present) {
  ctx._source.ports.add(params.port);
}
ctx._source.ip = params.ip;
ctx._source.scan = params.scan;
ctx._source.timestamp = params.timestamp;
"#;

const HTTP_SCRIPT: &str = r#"
if (ctx._source.http == null) {
  ctx._source.http = new ArrayList();
}
boolean push = true;
for (int i = 0; i < ctx._source.http.size(); i++) {
  def curr = ctx._source.http.get(i);
  if (curr.port == params.output.port) {
    if ('https'.equalsIgnoreCase(curr.scheme) && 'http'.equalsIgnoreCase(params.output.scheme)) {
      push = false;
    } else {
      ctx._source.http.remove(i);
    }
    break;
  }
}
if (push) {
  ctx._source.http.add(params.output);
}
ctx._source.ip = params.ip;
ctx._source.scan = params.scan;
ctx._source.timestamp = params.timestamp;
"#;

const DETECTIONS_SCRIPT: &str = r#"
if (ctx._source.detections == null) {
  ctx._source.detections = new ArrayList();
}
boolean push = true;
for (def curr : ctx._source.detections) {
  if (curr.port == params.detection.port && curr.template_id == params.detection.template_id) {
    push = false;
    break;
  }
}
if (push) {
  ctx._source.detections.add(params.detection);
}
ctx._source.ip = params.ip;
ctx._source.scan = params.scan;
ctx._source.timestamp = params.timestamp;
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeScript {
    /// masscan: `params.port` into `ports`, unique by port number.
    Ports,
    /// httpx: `params.output` into `http`, one entry per port, HTTPS preferred.
    Http,
    /// nuclei: `params.detection` into `detections`, unique by port and template.
    Detections,
}

impl MergeScript {
    pub fn source(&self) -> &'static str {
        match self {
            MergeScript::Ports => PORTS_SCRIPT,
            MergeScript::Http => HTTP_SCRIPT,
            MergeScript::Detections => DETECTIONS_SCRIPT,
        }
    }

    /// Apply the script to `doc` the way the search engine would.
    pub fn apply(&self, doc: &mut Map<String, Value>, params: &Value) {
        match self {
            MergeScript::Ports => {
                let entry = params.get("port").cloned().unwrap_or(Value::Null);
                with_array(doc, "ports", |list| {
                    if !list
                        .iter()
                        .any(|existing| existing.get("port") == entry.get("port"))
                    {
                        list.push(entry);
                    }
                });
            }
            MergeScript::Http => {
                let entry = params.get("output").cloned().unwrap_or(Value::Null);
                with_array(doc, "http", |list| {
                    let mut push = true;
                    if let Some(pos) = list
                        .iter()
                        .position(|existing| existing.get("port") == entry.get("port"))
                    {
                        if scheme_is(&list[pos], "https") && scheme_is(&entry, "http") {
                            push = false;
                        } else {
                            list.remove(pos);
                        }
                    }
                    if push {
                        list.push(entry);
                    }
                });
            }
            MergeScript::Detections => {
                let entry = params.get("detection").cloned().unwrap_or(Value::Null);
                with_array(doc, "detections", |list| {
                    let duplicate = list.iter().any(|existing| {
                        existing.get("port") == entry.get("port")
                            && existing.get("template_id") == entry.get("template_id")
                    });
                    if !duplicate {
                        list.push(entry);
                    }
                });
            }
        }

        for key in ["ip", "scan", "timestamp"] {
            if let Some(value) = params.get(key) {
                doc.insert(key.to_string(), value.clone());
            }
        }
    }
}

fn with_array(
    doc: &mut Map<String, Value>,
    key: &str,
    update: impl FnOnce(&mut Vec<Value>),
) {
    match doc.get_mut(key) {
        Some(Value::Array(list)) => update(list),
        _ => {
            let mut list = Vec::new();
            update(&mut list);
            doc.insert(key.to_string(), Value::Array(list));
        }
    }
}

fn scheme_is(entry: &Value, scheme: &str) -> bool {
    entry
        .get("scheme")
        .and_then(Value::as_str)
        .is_some_and(|value| value.eq_ignore_ascii_case(scheme))
}
