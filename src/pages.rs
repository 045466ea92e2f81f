//! Server-rendered HTML: the interstitial shown while an app starts or
//! after it fails, the dashboard on the control host, and small error pages.
//!
//! Pages are plain strings assembled in Rust; there is no template engine
//! and no asset pipeline. The interstitial polls the control API and
//! reloads itself once its app reports `running`.

const THEME_CSS: &str = r#"
:root {
  --bg: #ffffff; --text: #1a1a1a; --muted: #6b7280;
  --panel: #f3f4f6; --border: #d1d5db; --accent: #22c55e;
}
@media (prefers-color-scheme: dark) {
  :root.theme-system {
    --bg: #111827; --text: #f9fafb; --muted: #9ca3af;
    --panel: #1f2937; --border: #374151;
  }
}
:root.theme-dark {
  --bg: #111827; --text: #f9fafb; --muted: #9ca3af;
  --panel: #1f2937; --border: #374151;
}
body {
  background: var(--bg); color: var(--text);
  font-family: -apple-system, system-ui, sans-serif;
  margin: 0; padding: 48px 32px;
}
"#;

fn theme_class(theme: &str) -> &'static str {
    match theme {
        "light" => "theme-light",
        "dark" => "theme-dark",
        _ => "theme-system",
    }
}

/// Minimal HTML escaping for text interpolated into pages.
fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Body served with a 502 when a proxied backend stops answering. The
/// literal `Connecting...` is load-bearing: the interstitial script and
/// reload loop below key off it.
pub fn connecting_page() -> String {
    format!(
        r#"<!DOCTYPE html>
<html class="theme-system">
<head><meta charset="UTF-8"><title>Connecting...</title><style>{THEME_CSS}
.wrap {{ text-align: center; margin-top: 15vh; }}
.spinner {{ width: 32px; height: 32px; margin: 24px auto; border: 3px solid var(--border);
  border-top-color: var(--accent); border-radius: 50%; animation: spin 1s linear infinite; }}
@keyframes spin {{ to {{ transform: rotate(360deg); }} }}
</style></head>
<body><div class="wrap">
<h1>Connecting...</h1>
<div class="spinner"></div>
<p>The backend is not answering yet. Retrying.</p>
</div>
<script>setTimeout(function() {{ location.reload(); }}, 1000);</script>
</body></html>
"#
    )
}

/// The interstitial page for an app that is starting or has failed.
///
/// While starting it polls `/api/app-status` and `/api/logs` on the control
/// host and reloads once the app reports `running`. After a failure it
/// shows the captured logs, asks `/api/analyze-logs` to highlight error
/// lines, and offers a restart button wired to `/api/restart`.
pub fn interstitial(app_name: &str, tld: &str, theme: &str, failed: bool, error: &str) -> String {
    let status_text = if failed { "Failed to start" } else { "Starting" };
    let app = escape(app_name);
    let tld = escape(tld);
    let error = escape(error);
    let theme_class = theme_class(theme);

    format!(
        r#"<!DOCTYPE html>
<html class="{theme_class}">
<head>
<meta charset="UTF-8">
<title>{status_text} {app}</title>
<style>{THEME_CSS}
.container {{ max-width: 700px; margin: 0 auto; text-align: center; }}
h1 {{ font-size: 24px; margin-bottom: 12px; }}
.status {{ color: var(--muted); margin-bottom: 20px; }}
.status.error {{ color: #f87171; }}
.spinner {{ width: 40px; height: 40px; margin: 0 auto 24px; border: 3px solid var(--border);
  border-top-color: var(--accent); border-radius: 50%; animation: spin 1s linear infinite; }}
@keyframes spin {{ to {{ transform: rotate(360deg); }} }}
.logs {{ background: var(--panel); border: 1px solid var(--border); border-radius: 8px;
  padding: 16px; text-align: left; max-height: 350px; overflow-y: auto; margin-bottom: 24px;
  font-family: ui-monospace, monospace; font-size: 12px; line-height: 1.5;
  white-space: pre-wrap; word-break: break-all; }}
.logs mark {{ background: #fde04766; color: inherit; }}
.logs .empty {{ color: var(--muted); font-style: italic; }}
.btn {{ background: var(--accent); color: #fff; border: none; padding: 10px 24px;
  border-radius: 6px; font-size: 14px; cursor: pointer; display: none; }}
.btn:disabled {{ opacity: .6; cursor: not-allowed; }}
</style>
</head>
<body>
<div class="container" data-app="{app}" data-tld="{tld}" data-failed="{failed}" data-error="{error}">
  <h1>{app}</h1>
  <div class="status" id="status">{status_text}...</div>
  <div class="spinner" id="spinner"></div>
  <div class="logs" id="logs"><span class="empty">Waiting for output...</span></div>
  <button class="btn" id="retry" onclick="restartApp()">Restart</button>
</div>
<script>
var root = document.querySelector('.container');
var app = root.dataset.app, tld = root.dataset.tld;
var api = 'http://roost-dev.' + tld + '/api/';
var escapeHtml = function(s) {{
  return s.replace(/&/g, '&amp;').replace(/</g, '&lt;').replace(/>/g, '&gt;');
}};

function renderLogs(lines, errorLines) {{
  if (!lines || !lines.length) return;
  var marked = new Set(errorLines || []);
  document.getElementById('logs').innerHTML = lines.map(function(line, i) {{
    var html = escapeHtml(line);
    return marked.has(i) ? '<mark>' + html + '</mark>' : html;
  }}).join('\n');
}}

function showFailure(msg) {{
  document.getElementById('spinner').style.display = 'none';
  var el = document.getElementById('status');
  el.textContent = 'Failed to start' + (msg ? ': ' + msg : '');
  el.classList.add('error');
  var btn = document.getElementById('retry');
  btn.style.display = 'inline-block';
  btn.disabled = false;
  fetch(api + 'logs?name=' + encodeURIComponent(app))
    .then(function(r) {{ return r.json(); }})
    .then(function(lines) {{
      renderLogs(lines);
      return fetch(api + 'analyze-logs?name=' + encodeURIComponent(app))
        .then(function(r) {{ return r.json(); }})
        .then(function(a) {{ if (a.enabled && a.errorLines) renderLogs(lines, a.errorLines); }});
    }})
    .catch(function() {{}});
}}

function poll() {{
  Promise.all([
    fetch(api + 'app-status?name=' + encodeURIComponent(app)).then(function(r) {{ return r.json(); }}),
    fetch(api + 'logs?name=' + encodeURIComponent(app)).then(function(r) {{ return r.json(); }})
  ]).then(function(results) {{
    var status = results[0];
    renderLogs(results[1]);
    if (status.status === 'running') {{
      document.getElementById('status').textContent = 'Ready! Redirecting...';
      setTimeout(function() {{ location.reload(); }}, 300);
    }} else if (status.status === 'failed') {{
      showFailure(status.error);
    }} else {{
      setTimeout(poll, 200);
    }}
  }}).catch(function() {{ setTimeout(poll, 1000); }});
}}

function restartApp() {{
  var btn = document.getElementById('retry');
  btn.disabled = true;
  fetch(api + 'restart?name=' + encodeURIComponent(app)).then(function(res) {{
    if (!res.ok) throw new Error('restart returned ' + res.status);
    btn.style.display = 'none';
    var el = document.getElementById('status');
    el.textContent = 'Starting...';
    el.classList.remove('error');
    document.getElementById('spinner').style.display = 'block';
    document.getElementById('logs').innerHTML = '<span class="empty">Restarting...</span>';
    poll();
  }}).catch(function(e) {{
    btn.disabled = false;
    document.getElementById('status').textContent = 'Restart failed: ' + e.message;
  }});
}}

if (root.dataset.failed === 'true') {{
  showFailure(root.dataset.error);
}} else {{
  poll();
}}
</script>
</body>
</html>
"#
    )
}

/// Dashboard served at the control host root. Lists every app with its
/// live status and keeps itself fresh over `/api/events`.
pub fn dashboard(tld: &str, theme: &str) -> String {
    let tld = escape(tld);
    let theme_class = theme_class(theme);

    format!(
        r#"<!DOCTYPE html>
<html class="{theme_class}">
<head>
<meta charset="UTF-8">
<title>roost-dev</title>
<style>{THEME_CSS}
.container {{ max-width: 760px; margin: 0 auto; }}
h1 {{ font-size: 22px; }}
table {{ width: 100%; border-collapse: collapse; margin-top: 16px; }}
th, td {{ text-align: left; padding: 8px 12px; border-bottom: 1px solid var(--border); }}
th {{ color: var(--muted); font-size: 12px; text-transform: uppercase; }}
.state {{ font-size: 12px; padding: 2px 8px; border-radius: 10px; background: var(--panel); }}
.state.running {{ color: var(--accent); }}
.state.failed {{ color: #f87171; }}
.svc {{ color: var(--muted); padding-left: 28px; }}
a {{ color: inherit; }}
.empty {{ color: var(--muted); margin-top: 24px; }}
</style>
</head>
<body>
<div class="container" data-tld="{tld}">
  <h1>roost-dev</h1>
  <table>
    <thead><tr><th>App</th><th>Status</th><th>URL</th></tr></thead>
    <tbody id="apps"></tbody>
  </table>
  <div class="empty" id="empty" style="display:none">No apps configured.</div>
</div>
<script>
var tld = document.querySelector('.container').dataset.tld;

function stateLabel(running) {{ return running ? 'running' : 'idle'; }}

function render(apps) {{
  var body = document.getElementById('apps');
  document.getElementById('empty').style.display = apps.length ? 'none' : 'block';
  var rows = [];
  apps.forEach(function(app) {{
    var status = app.type === 'multi-service'
      ? app.services.filter(function(s) {{ return s.running; }}).length + '/' + app.services.length
      : stateLabel(app.running);
    rows.push('<tr><td>' + app.name + '</td><td><span class="state ' +
      (app.running ? 'running' : '') + '">' + status + '</span></td><td><a href="' +
      app.url + '">' + app.url + '</a></td></tr>');
    (app.services || []).forEach(function(svc) {{
      rows.push('<tr><td class="svc">' + svc.name + (svc.default ? ' (default)' : '') +
        '</td><td><span class="state ' + (svc.running ? 'running' : '') + '">' +
        stateLabel(svc.running) + '</span></td><td><a href="' + svc.url + '">' + svc.url +
        '</a></td></tr>');
    }});
  }});
  body.innerHTML = rows.join('');
}}

function refresh() {{
  fetch('/api/status').then(function(r) {{ return r.json(); }}).then(render);
}}

refresh();
var events = new EventSource('/api/events');
events.onmessage = function(msg) {{
  try {{ render(JSON.parse(msg.data)); }} catch (e) {{ refresh(); }}
}};
</script>
</body>
</html>
"#
    )
}

/// 404 for hostnames no app answers to, listing what would have worked.
pub fn unknown_host(host: &str, known: &[String]) -> String {
    let host = escape(host);
    let list = if known.is_empty() {
        "<li class=\"empty\">No apps configured.</li>".to_string()
    } else {
        known
            .iter()
            .map(|h| format!("<li><a href=\"http://{}\">{}</a></li>", escape(h), escape(h)))
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        r#"<!DOCTYPE html>
<html class="theme-system">
<head><meta charset="UTF-8"><title>Unknown host</title><style>{THEME_CSS}
.container {{ max-width: 600px; margin: 0 auto; }}
.empty {{ color: var(--muted); }}
a {{ color: inherit; }}
</style></head>
<body><div class="container">
<h1>No app for {host}</h1>
<p>Known hosts:</p>
<ul>
{list}
</ul>
</div></body></html>
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interstitial_starting_contains_marker_and_poll() {
        let html = interstitial("myapp", "test", "system", false, "");
        assert!(html.contains("Starting..."));
        assert!(html.contains("data-app=\"myapp\""));
        assert!(html.contains("/api/app-status"));
        assert!(html.contains("/api/logs"));
    }

    #[test]
    fn interstitial_failed_contains_marker_and_restart() {
        let html = interstitial("myapp", "test", "dark", true, "boom");
        assert!(html.contains("Failed to start"));
        assert!(html.contains("data-failed=\"true\""));
        assert!(html.contains("/api/restart"));
        assert!(html.contains("theme-dark"));
    }

    #[test]
    fn interstitial_escapes_interpolated_values() {
        let html = interstitial("<script>", "test", "system", true, "<b>err</b>");
        assert!(!html.contains("data-app=\"<script>\""));
        assert!(html.contains("&lt;script&gt;"));
        assert!(html.contains("&lt;b&gt;err&lt;/b&gt;"));
    }

    #[test]
    fn connecting_page_has_literal_text() {
        assert!(connecting_page().contains("Connecting..."));
    }

    #[test]
    fn unknown_host_lists_known_hosts() {
        let html = unknown_host("nope.test", &["a.test".to_string(), "b.test".to_string()]);
        assert!(html.contains("No app for nope.test"));
        assert!(html.contains("http://a.test"));
        assert!(html.contains("http://b.test"));
    }

    #[test]
    fn dashboard_subscribes_to_events() {
        let html = dashboard("test", "light");
        assert!(html.contains("/api/events"));
        assert!(html.contains("/api/status"));
        assert!(html.contains("theme-light"));
    }
}
