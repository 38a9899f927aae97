pub async fn root_handler() -> &'static str {
    "This page is intentionally left blank. You might want to check /health"
}
