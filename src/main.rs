fn main() {
    docsift_lib::run()
}
