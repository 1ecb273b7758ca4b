fn main() {
    viaduct::run();
}
