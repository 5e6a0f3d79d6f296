//! Server-rendered HTML for the browser flow.

use std::fmt::Write as _;

use crate::{catalog::FormatProfile, extractor::VideoMetadata};

pub enum PageView<'a> {
    Empty,
    Error(&'a str),
    Video {
        url: &'a str,
        metadata: &'a VideoMetadata,
        catalog: &'a [FormatProfile],
    },
}

pub fn render(view: PageView<'_>) -> String {
    let body = match view {
        PageView::Empty => String::new(),
        PageView::Error(message) => format!(
            r#"<div class="error" role="alert">{}</div>"#,
            escape(message)
        ),
        PageView::Video {
            url,
            metadata,
            catalog,
        } => render_video(url, metadata, catalog),
    };

    format!(
        r#"<!DOCTYPE html>
<html lang="es">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>VideoDrop</title>
<style>{STYLE}</style>
</head>
<body>
<main>
<h1>VideoDrop</h1>
<form method="post" action="/process" class="search">
<input type="url" name="url" placeholder="https://www.youtube.com/watch?v=..." required>
<button type="submit">Buscar formatos</button>
</form>
{body}
</main>
<script>{SCRIPT}</script>
</body>
</html>
"#
    )
}

fn render_video(url: &str, metadata: &VideoMetadata, catalog: &[FormatProfile]) -> String {
    let mut html = String::new();
    let url = escape(url);

    html.push_str(r#"<section class="video">"#);
    if let Some(thumbnail) = metadata.thumbnail.as_deref() {
        let _ = write!(
            html,
            r#"<img src="{}" alt="Miniatura">"#,
            escape(thumbnail)
        );
    }
    let _ = write!(
        html,
        r#"<h2>{}</h2><p>Duracion: {}</p>"#,
        escape(metadata.display_title()),
        format_duration(metadata.duration_seconds())
    );

    html.push_str(r#"<ul class="formats">"#);
    for profile in catalog {
        let selector = escape(&profile.selector);
        let _ = write!(
            html,
            r#"<li>
<div><strong>{label}</strong> <span>{kind} {ext}</span> <span>{size}</span><br><small>{description}</small></div>
<form method="post" action="/download">
<input type="hidden" name="url" value="{url}">
<input type="hidden" name="format_id" value="{selector}">
<button type="submit">Descargar</button>
<button type="button" data-url="{url}" data-format="{selector}" class="tracked">Con progreso</button>
</form>
<progress max="100" value="0" hidden></progress>
</li>"#,
            label = escape(&profile.label),
            kind = if profile.is_audio_only() { "Audio" } else { "Video" },
            ext = escape(&profile.ext),
            size = format_filesize(profile.estimated_bytes),
            description = escape(&profile.description),
        );
    }
    html.push_str("</ul></section>");
    html
}

/// `m:ss`, or `N/A` when the length is unknown.
pub fn format_duration(seconds: Option<u64>) -> String {
    match seconds {
        Some(seconds) if seconds > 0 => format!("{}:{:02}", seconds / 60, seconds % 60),
        _ => "N/A".to_string(),
    }
}

pub fn format_filesize(bytes: Option<u64>) -> String {
    let Some(bytes) = bytes.filter(|bytes| *bytes > 0) else {
        return "Calculando...".to_string();
    };

    let mb = bytes as f64 / 1_048_576.0;
    if mb < 1.0 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if mb < 1024.0 {
        format!("{mb:.1} MB")
    } else {
        format!("{:.2} GB", mb / 1024.0)
    }
}

fn escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for character in value.chars() {
        match character {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            other => escaped.push(other),
        }
    }
    escaped
}

const STYLE: &str = "body{font-family:system-ui,sans-serif;background:#111;color:#eee;margin:0}\
main{max-width:720px;margin:0 auto;padding:2rem 1rem}\
form.search{display:flex;gap:.5rem}input[type=url]{flex:1;padding:.6rem}\
button{padding:.5rem .9rem;cursor:pointer}\
.error{background:#5c1a1a;padding:1rem;margin-top:1rem;border-radius:6px}\
.video img{max-width:100%;border-radius:6px;margin-top:1rem}\
.formats{list-style:none;padding:0}.formats li{border-bottom:1px solid #333;padding:.8rem 0}\
.formats form{margin-top:.4rem;display:flex;gap:.5rem}progress{width:100%}";

const SCRIPT: &str = r#"
document.querySelectorAll('button.tracked').forEach(function (button) {
  button.addEventListener('click', async function () {
    var item = button.closest('li');
    var bar = item.querySelector('progress');
    var body = new URLSearchParams({url: button.dataset.url, format_id: button.dataset.format});
    button.disabled = true;
    bar.hidden = false;
    try {
      var started = await fetch('/start_download', {method: 'POST', body: body});
      var payload = await started.json();
      if (!started.ok) { throw new Error(payload.error || 'Error'); }
      var id = payload.download_id;
      while (true) {
        await new Promise(function (resolve) { setTimeout(resolve, 1000); });
        var polled = await fetch('/download_progress/' + id);
        var record = await polled.json();
        if (!polled.ok) { throw new Error(record.error || 'Error'); }
        bar.value = record.progress || 0;
        if (record.status === 'finished') { window.location = '/download_file/' + id; break; }
        if (record.status === 'error') { throw new Error(record.error); }
      }
    } catch (error) {
      alert(error.message);
      bar.hidden = true;
    } finally {
      button.disabled = false;
    }
  });
});
"#;
