fn main() {
    println!("{}", hello_repo::greet("World"));
}
