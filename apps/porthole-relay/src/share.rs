//! Share landing pages: the human-facing URL the tunnel client prints.

use axum::extract::Path;
use axum::response::Html;

const SHARE_HTML: &str = include_str!("../static/share.html");

pub async fn share_page(Path((namespace, id)): Path<(String, String)>) -> Html<String> {
    Html(render(&namespace, &id))
}

/// `/s/<id>` form: the namespace defaults to the id.
pub async fn share_page_default_namespace(Path(id): Path<String>) -> Html<String> {
    Html(render(&id.clone(), &id))
}

fn render(namespace: &str, id: &str) -> String {
    let stream = if namespace == id {
        id.to_string()
    } else {
        format!("{namespace}/{id}")
    };
    SHARE_HTML
        .replace("{{stream}}", &escape(&stream))
        .replace("{{namespace}}", &escape(namespace))
        .replace("{{id}}", &escape(id))
}

fn escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_interpolates_stream() {
        let page = render("team", "tty-1");
        assert!(page.contains("team/tty-1"));
        assert!(page.contains("data-namespace=\"team\""));
    }

    #[test]
    fn render_escapes_markup() {
        let page = render("a", "<script>");
        assert!(!page.contains("<script>"));
        assert!(page.contains("&lt;script&gt;"));
    }
}
