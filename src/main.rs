use cinder::uci::{UciHandler, ENGINE_NAME};

fn main() {
    env_logger::init();
    println!("{ENGINE_NAME}");
    let mut handler = UciHandler::new();
    handler.run();
}
