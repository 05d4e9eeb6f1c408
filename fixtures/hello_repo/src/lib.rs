pub fn greet(name: &str) -> String {
    // TODO: add proper greeting
    format!("Hello, {}!", name)
}
