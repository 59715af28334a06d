fn main() {
    thoughtgate::run();
}
