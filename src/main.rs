fn main() -> anyhow::Result<()> {
    buffet_pos_lib::cli::run()
}
