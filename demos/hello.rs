// demos/hello.rs
//
// Minimal embedding of the engine: a JSON route, a plain-text route, and
// the static-file fallback rooted at the current directory.
//
//   RUST_LOG=debug cargo run --example hello
use serde_json::json;

use ravel::{HttpRequest, Response, Router, Server, ServerConf};

fn hello(_req: &HttpRequest) -> Response {
    Response::ok("hello from ravel\n")
}

fn greet(req: &HttpRequest) -> Response {
    let name = req.param("name").unwrap_or("world");
    Response::json(&json!({ "greeting": format!("hello, {}", name) }))
}

fn echo(req: &HttpRequest) -> Response {
    Response::ok(req.body().to_vec())
}

fn main() -> ravel::EngineResult<()> {
    ravel::logging::init_logging();

    let mut router = Router::new();
    router.get("/hello", hello);
    router.get("/greet", greet);
    router.post("/echo", echo);

    let conf = ServerConf::new(8080, ".").host("0.0.0.0");
    Server::new(conf)?.serve(router)
}
