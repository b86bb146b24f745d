use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::{fs, path::Path};

use crate::{
    browser_controller::PageHandle,
    types::{ExtractedArtifacts, TriggerDescriptor, TweenDescriptor},
    utils::{DOM_SNAPSHOT_JSON, GSAP_TWEENS_JSON, RENDERED_HTML, SCROLL_TRIGGERS_JSON},
};

/// Reads ScrollTrigger and gsap global state, each library in its own `try`.
/// Returns a JSON string; DOM nodes are replaced by an id/class/tag reference
/// and cycles are cut.
pub const ANIMATION_PROBE_SCRIPT: &str = r#"(() => {
    const nodeRef = (el) => {
        if (el == null) return '';
        if (typeof el !== 'object') return String(el);
        return el.id || (typeof el.className === 'string' && el.className) || el.tagName || 'object';
    };
    const clean = (value) => {
        const seen = new WeakSet();
        try {
            const s = JSON.stringify(value, (key, v) => {
                if (typeof v === 'function') return undefined;
                if (typeof Element !== 'undefined' && v instanceof Element) return nodeRef(v);
                if (v && typeof v === 'object') {
                    if (seen.has(v)) return undefined;
                    seen.add(v);
                }
                return v;
            });
            return s === undefined ? null : JSON.parse(s);
        } catch (e) {
            return null;
        }
    };
    const num = (v) => (typeof v === 'number' && isFinite(v) ? v : null);
    const out = { scrolltriggers: [], gsaptweens: [], errors: [] };
    try {
        const st = window.ScrollTrigger;
        if (st && typeof st.getAll === 'function') {
            out.scrolltriggers = st.getAll().map((t) => ({
                trigger: t.trigger
                    ? t.trigger.id || (typeof t.trigger.className === 'string' && t.trigger.className) || null
                    : null,
                start: num(t.start),
                end: num(t.end),
                scrub: t.vars ? clean(t.vars.scrub) : null,
                pin: t.vars ? clean(t.vars.pin) : null,
                vars: clean(t.vars) || {},
            }));
        }
    } catch (e) {
        out.errors.push('ScrollTrigger: ' + e);
    }
    try {
        const g = window.gsap;
        if (g && g.globalTimeline && typeof g.globalTimeline.getChildren === 'function') {
            out.gsaptweens = g.globalTimeline.getChildren().map((ch) => ({
                id: ch.vars && ch.vars.id != null ? String(ch.vars.id) : null,
                targets: typeof ch.targets === 'function' ? Array.from(ch.targets() || []).map(nodeRef) : [],
                duration: typeof ch.duration === 'function' ? num(Number(ch.duration())) || 0 : 0,
                vars: clean(ch.vars) || {},
            }));
        }
    } catch (e) {
        out.errors.push('gsap: ' + e);
    }
    return JSON.stringify(out);
})()"#;

#[derive(Debug, Default, Deserialize)]
struct AnimationProbe {
    #[serde(default)]
    scrolltriggers: Vec<Value>,
    #[serde(default)]
    gsaptweens: Vec<Value>,
    #[serde(default)]
    errors: Vec<String>,
}

/// Pulls everything worth keeping out of a settled page. Never fails: each
/// piece that cannot be read is left empty and logged.
pub fn extract<P: PageHandle + ?Sized>(page: &P) -> ExtractedArtifacts {
    let rendered_html = match page.content() {
        Ok(html) => Some(html),
        Err(e) => {
            warn!("could not read rendered html: {:#}", e);
            None
        }
    };

    let dom_snapshot = match page.dom_snapshot() {
        Ok(snapshot) => Some(snapshot),
        Err(e) => {
            warn!("dom snapshot unavailable: {:#}", e);
            None
        }
    };

    let (scroll_triggers, gsap_tweens) = match extract_animations(page) {
        Ok(found) => found,
        Err(e) => {
            warn!("animation state unavailable: {:#}", e);
            (vec![], vec![])
        }
    };

    ExtractedArtifacts {
        rendered_html,
        dom_snapshot,
        scroll_triggers,
        gsap_tweens,
    }
}

pub fn extract_animations<P: PageHandle + ?Sized>(
    page: &P,
) -> Result<(Vec<TriggerDescriptor>, Vec<TweenDescriptor>)> {
    let value = page
        .evaluate(ANIMATION_PROBE_SCRIPT, false)
        .context("animation probe failed")?;
    let probe: AnimationProbe = match value {
        Some(Value::String(s)) => {
            serde_json::from_str(&s).context("animation probe returned invalid json")?
        }
        Some(v @ Value::Object(_)) => serde_json::from_value(v)?,
        _ => AnimationProbe::default(),
    };
    for e in &probe.errors {
        warn!("animation probe: {}", e);
    }
    Ok((
        descriptors(probe.scrolltriggers, "scroll trigger"),
        descriptors(probe.gsaptweens, "gsap tween"),
    ))
}

fn descriptors<T: DeserializeOwned>(raw: Vec<Value>, what: &str) -> Vec<T> {
    raw.into_iter()
        .filter_map(|v| match serde_json::from_value(v) {
            Ok(d) => Some(d),
            Err(e) => {
                debug!("dropping malformed {}: {}", what, e);
                None
            }
        })
        .collect()
}

/// Writes the extracted artifacts under `output_root` and returns the names
/// of the files that made it to disk.
pub fn write_artifacts(output_root: &Path, artifacts: &ExtractedArtifacts) -> Vec<&'static str> {
    let mut written = vec![];

    if let Some(html) = &artifacts.rendered_html {
        record(
            &mut written,
            RENDERED_HTML,
            fs::write(output_root.join(RENDERED_HTML), html).map_err(Into::into),
        );
    }
    if let Some(snapshot) = &artifacts.dom_snapshot {
        record(
            &mut written,
            DOM_SNAPSHOT_JSON,
            write_json(&output_root.join(DOM_SNAPSHOT_JSON), snapshot),
        );
    }
    if !artifacts.scroll_triggers.is_empty() {
        record(
            &mut written,
            SCROLL_TRIGGERS_JSON,
            write_json(
                &output_root.join(SCROLL_TRIGGERS_JSON),
                &artifacts.scroll_triggers,
            ),
        );
    }
    if !artifacts.gsap_tweens.is_empty() {
        record(
            &mut written,
            GSAP_TWEENS_JSON,
            write_json(&output_root.join(GSAP_TWEENS_JSON), &artifacts.gsap_tweens),
        );
    }
    written
}

fn record(written: &mut Vec<&'static str>, name: &'static str, res: Result<()>) {
    match res {
        Ok(_) => written.push(name),
        Err(e) => warn!("could not write {}: {:#}", name, e),
    }
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    fs::write(path, bytes).context(format!("could not write {:?}", path))
}
