use axum::response::Html;

const PAGE: &str = r#"<!doctype html>
<html>
  <head><title>Object detection</title></head>
  <body style="margin:0;background:#111">
    <img src="/video_feed" style="display:block;margin:auto;max-width:100%">
  </body>
</html>
"#;

pub async fn index() -> Html<&'static str> {
    Html(PAGE)
}
