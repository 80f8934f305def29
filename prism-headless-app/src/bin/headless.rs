use prism_headless_app::app::HeadlessApp;

fn main() -> anyhow::Result<()> {
    HeadlessApp::init_env();
    HeadlessApp::run()
}
