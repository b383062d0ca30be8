use fedgate_main::Gateway;

fn main() {
    Gateway::main()
}
