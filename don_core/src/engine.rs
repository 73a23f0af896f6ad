//! JavaScript engine for user code.
//!
//! Each run gets a fresh QuickJS runtime on its own OS thread. The thread
//! owns the interpreter; the async side owns the [`ScriptScope`] and serves
//! the script's host calls over a channel:
//!
//! ```text
//!  async task (ScriptScope)                 js-<slot> thread (QuickJS)
//!  ------------------------                 --------------------------
//!  serve() <------- HostCall::Http -------- Functions.makeHttpRequest
//!     | make_http_request().await
//!     +------------ HttpResult -----------> resolves the promise
//!  serve() <------- HostCall::Done -------- result bytes / error
//! ```
//!
//! Compute is bounded inside the interpreter: an interrupt hook stops the
//! script once its fuel or its real-time deadline runs out, or once the
//! run is dropped. Memory is capped by the QuickJS allocator.

use crate::config::CodeLanguage;
use crate::sandbox::{HttpResult, SandboxLimits, ScriptEngine, ScriptError, ScriptScope};
use async_trait::async_trait;
use don_env::HttpRequest;
use rquickjs::{Context, Function, Runtime};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, OnceLock};
use std::time::Instant;
use tracing::debug;

/// Stack size of a script thread.
const THREAD_STACK_BYTES: usize = 8 * 1024 * 1024;

/// Interpreter stack limit; stays well inside the thread stack.
const JS_STACK_BYTES: usize = 1024 * 1024;

/// Sets up the globals user code sees, compiles the source as the body of
/// an async function and records how it settles.
const PRELUDE: &str = r#"
(function () {
  "use strict";
  const AsyncFunction = Object.getPrototypeOf(async function () {}).constructor;
  const WORD = 1n << 256n;
  const INT_MAX = (1n << 255n) - 1n;
  const INT_MIN = -(1n << 255n);

  const describe = (e) =>
    e instanceof Error
      ? e.name === "Error" ? e.message : e.name + ": " + e.message
      : String(e);

  const integer = (value, name) => {
    if (typeof value === "bigint") return value;
    if (typeof value === "number" && Number.isSafeInteger(value)) return BigInt(value);
    throw new RangeError(name + " expects a safe integer or a BigInt, got " + value);
  };

  const word = (n) => {
    const hex = n.toString(16).padStart(64, "0");
    const out = new Uint8Array(32);
    for (let i = 0; i < 32; i++) out[i] = parseInt(hex.slice(2 * i, 2 * i + 2), 16);
    return out;
  };

  const toHex = (bytes) => {
    let hex = "";
    for (let i = 0; i < bytes.length; i++) hex += bytes[i].toString(16).padStart(2, "0");
    return hex;
  };

  const utf8 = (s) => {
    const bin = unescape(encodeURIComponent(s));
    const out = new Uint8Array(bin.length);
    for (let i = 0; i < bin.length; i++) out[i] = bin.charCodeAt(i);
    return out;
  };

  const withParams = (url, params) => {
    const keys = Object.keys(params || {});
    if (keys.length === 0) return url;
    const query = keys
      .map((k) => encodeURIComponent(k) + "=" + encodeURIComponent(String(params[k])))
      .join("&");
    return url + (url.indexOf("?") >= 0 ? "&" : "?") + query;
  };

  globalThis.Functions = Object.freeze({
    encodeUint256(value) {
      const n = integer(value, "encodeUint256");
      if (n < 0n || n >= WORD) throw new RangeError("encodeUint256 value out of range");
      return word(n);
    },
    encodeInt256(value) {
      const n = integer(value, "encodeInt256");
      if (n < INT_MIN || n > INT_MAX) throw new RangeError("encodeInt256 value out of range");
      return word(n < 0n ? WORD + n : n);
    },
    encodeString(value) {
      if (typeof value !== "string") throw new TypeError("encodeString expects a string");
      return utf8(value);
    },
    async makeHttpRequest(config) {
      if (!config || typeof config.url !== "string") {
        throw new TypeError("makeHttpRequest needs a url");
      }
      const request = {
        url: withParams(config.url, config.params),
        method: String(config.method || "GET").toUpperCase(),
        headers: config.headers || {},
      };
      if (config.data !== undefined) request.data = config.data;
      const reply = JSON.parse(__don_http(JSON.stringify(request)));
      if ("fatal" in reply) throw new Error(reply.fatal);
      return reply.ok;
    },
  });
  globalThis.args = Object.freeze(JSON.parse(__don_args));
  globalThis.secrets = Object.freeze(JSON.parse(__don_secrets));

  let body;
  try {
    body = new AsyncFunction(__don_source);
  } catch (e) {
    globalThis.__don_error = describe(e);
    return;
  }
  body().then(
    (value) => {
      const bytes = value instanceof ArrayBuffer ? new Uint8Array(value) : value;
      if (bytes instanceof Uint8Array) {
        globalThis.__don_result = toHex(bytes);
      } else {
        globalThis.__don_error = "returned value not an ArrayBuffer or Uint8Array";
      }
    },
    (e) => {
      globalThis.__don_error = describe(e);
    }
  );
})();
"#;

// ============================================================================
// HOST BRIDGE
// ============================================================================

/// A request from the script thread to the async side.
enum HostCall {
    Http {
        request: HttpRequest,
        reply: mpsc::Sender<Result<HttpResult, ScriptError>>,
    },
    Done(Result<Vec<u8>, ScriptError>),
}

/// Everything the script thread needs, owned.
struct ScriptJob {
    source: String,
    args: String,
    secrets: String,
    limits: SandboxLimits,
}

/// Why the interrupt hook stopped a script.
#[derive(Debug, Clone, Copy)]
enum Stop {
    Fuel,
    Deadline,
    Cancelled,
}

impl Stop {
    fn describe(&self, limits: &SandboxLimits) -> String {
        match self {
            Stop::Fuel => format!("compute budget of {} exhausted", limits.max_fuel),
            Stop::Deadline => format!("exceeded {}ms", limits.timeout.as_millis()),
            Stop::Cancelled => "run cancelled".to_string(),
        }
    }
}

/// Raises the cancel flag when the run future goes away.
struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

fn engine_error(e: impl std::fmt::Display) -> ScriptError {
    ScriptError::Engine(e.to_string())
}

/// Performs `makeHttpRequest` for the script thread. Blocks it until the
/// async side answers.
fn host_http(calls: &mpsc::Sender<HostCall>, request: &str) -> String {
    let outcome = serde_json::from_str::<HttpRequest>(request)
        .map_err(|e| ScriptError::thrown(format!("invalid HTTP request: {}", e)))
        .and_then(|request| {
            let (reply, answer) = mpsc::channel();
            calls
                .send(HostCall::Http { request, reply })
                .map_err(|_| engine_error("host went away"))?;
            answer.recv().map_err(|_| engine_error("host went away"))?
        });

    let reply = match outcome {
        Ok(result) => json!({
            "ok": {
                "error": result.error,
                "data": result.data,
                "status": result.response.as_ref().map(|r| r.status),
                "message": result.message,
            }
        }),
        Err(e) => json!({ "fatal": e.to_string() }),
    };
    reply.to_string()
}

/// Interrupt hook enforcing fuel, deadline and cancellation.
///
/// QuickJS polls it periodically on calls and backward jumps; one poll is
/// one unit of fuel.
fn budget_hook(
    limits: &SandboxLimits,
    cancel: Arc<AtomicBool>,
    stopped: Arc<OnceLock<Stop>>,
) -> impl FnMut() -> bool + Send + 'static {
    let deadline = Instant::now().checked_add(limits.timeout);
    let max_fuel = limits.max_fuel;
    let mut polls: u64 = 0;
    move || {
        polls += 1;
        let stop = if cancel.load(Ordering::Relaxed) {
            Some(Stop::Cancelled)
        } else if polls > max_fuel {
            Some(Stop::Fuel)
        } else if deadline.is_some_and(|d| Instant::now() >= d) {
            Some(Stop::Deadline)
        } else {
            None
        };
        match stop {
            Some(reason) => {
                stopped.get_or_init(|| reason);
                true
            }
            None => false,
        }
    }
}

// ============================================================================
// SCRIPT THREAD
// ============================================================================

fn evaluate(
    job: &ScriptJob,
    calls: &mpsc::Sender<HostCall>,
    cancel: Arc<AtomicBool>,
) -> Result<Vec<u8>, ScriptError> {
    let runtime = Runtime::new().map_err(engine_error)?;
    runtime.set_memory_limit(job.limits.max_memory_bytes);
    runtime.set_max_stack_size(JS_STACK_BYTES);
    let stopped = Arc::new(OnceLock::new());
    runtime.set_interrupt_handler(Some(Box::new(budget_hook(
        &job.limits,
        cancel,
        stopped.clone(),
    ))));
    let context = Context::full(&runtime).map_err(engine_error)?;

    let started = context.with(|ctx| -> rquickjs::Result<()> {
        let globals = ctx.globals();
        globals.set("__don_source", job.source.as_str())?;
        globals.set("__don_args", job.args.as_str())?;
        globals.set("__don_secrets", job.secrets.as_str())?;

        let host = calls.clone();
        let http = Function::new(ctx.clone(), move |request: String| -> String {
            host_http(&host, &request)
        })?;
        globals.set("__don_http", http)?;

        ctx.eval::<(), _>(PRELUDE)
    });

    while stopped.get().is_none() && runtime.is_job_pending() {
        if runtime.execute_pending_job().is_err() {
            break;
        }
    }

    if let Some(stop) = stopped.get() {
        debug!("script interrupted: {:?}", stop);
        return Err(ScriptError::Interrupted(stop.describe(&job.limits)));
    }
    started.map_err(engine_error)?;

    let (error, result) = context
        .with(|ctx| -> rquickjs::Result<(Option<String>, Option<String>)> {
            let globals = ctx.globals();
            Ok((globals.get("__don_error")?, globals.get("__don_result")?))
        })
        .map_err(engine_error)?;

    match (error, result) {
        (Some(message), _) => Err(ScriptError::Thrown(message)),
        (None, Some(value)) => hex::decode(value).map_err(engine_error),
        (None, None) => Err(ScriptError::thrown("script did not finish")),
    }
}

/// Answers host calls until the script thread reports a result.
async fn serve(
    mut calls: mpsc::Receiver<HostCall>,
    scope: &mut ScriptScope,
) -> Result<Vec<u8>, ScriptError> {
    loop {
        let (back, call) = tokio::task::spawn_blocking(move || {
            let call = calls.recv();
            (calls, call)
        })
        .await
        .map_err(engine_error)?;
        calls = back;

        match call {
            Ok(HostCall::Http { request, reply }) => {
                let result = scope.make_http_request(request).await;
                if reply.send(result).is_err() {
                    debug!("{} script stopped during an HTTP call", scope.slot());
                }
            }
            Ok(HostCall::Done(result)) => return result,
            Err(_) => return Err(engine_error("script thread exited without a result")),
        }
    }
}

// ============================================================================
// ENGINE
// ============================================================================

/// Runs JavaScript sources on QuickJS.
///
/// The source is the body of an async function: it may `await` and must
/// `return` a `Uint8Array` or `ArrayBuffer`, typically built with
/// `Functions.encodeUint256`, `Functions.encodeInt256` or
/// `Functions.encodeString`. `args`, `secrets` and
/// `Functions.makeHttpRequest` are taken from the run's [`ScriptScope`].
#[derive(Debug, Clone, Copy, Default)]
pub struct QuickJsEngine;

#[async_trait]
impl ScriptEngine for QuickJsEngine {
    async fn run(
        &self,
        language: CodeLanguage,
        source: &str,
        scope: &mut ScriptScope,
        limits: &SandboxLimits,
    ) -> Result<Vec<u8>, ScriptError> {
        let CodeLanguage::JavaScript = language;
        let job = ScriptJob {
            source: source.to_string(),
            args: serde_json::to_string(scope.args()).map_err(engine_error)?,
            secrets: scope.secrets().to_json().to_string(),
            limits: limits.clone(),
        };

        let (tx, calls) = mpsc::channel();
        let cancel = CancelOnDrop(Arc::new(AtomicBool::new(false)));
        let flag = cancel.0.clone();
        std::thread::Builder::new()
            .name(format!("js-{}", scope.slot().0))
            .stack_size(THREAD_STACK_BYTES)
            .spawn(move || {
                let result = evaluate(&job, &tx, flag);
                if tx.send(HostCall::Done(result)).is_err() {
                    debug!("script finished after its run was dropped");
                }
            })
            .map_err(|e| engine_error(format!("could not start script thread: {}", e)))?;

        let result = serve(calls, scope).await;
        drop(cancel);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::{NodeSecrets, SecretsMap};
    use crate::value::{ReturnType, ReturnValue};
    use don_env::{EnvError, HttpMethod, HttpResponse, HttpTransport, NodeSlot};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Records every request and answers with `response`.
    struct RecordingHttp {
        seen: Mutex<Vec<HttpRequest>>,
        response: HttpResponse,
    }

    #[async_trait]
    impl HttpTransport for RecordingHttp {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse, EnvError> {
            self.seen.lock().unwrap().push(request);
            Ok(self.response.clone())
        }

        fn local_slot(&self) -> NodeSlot {
            NodeSlot(0)
        }
    }

    fn http(response: HttpResponse) -> Arc<RecordingHttp> {
        Arc::new(RecordingHttp {
            seen: Mutex::new(Vec::new()),
            response,
        })
    }

    fn scope_with(
        args: &[&str],
        secrets: &[(&str, &str)],
        http: Arc<RecordingHttp>,
        limits: &SandboxLimits,
    ) -> ScriptScope {
        let values: SecretsMap = secrets.iter().copied().collect();
        ScriptScope::new(
            NodeSlot(0),
            args.iter().map(|a| a.to_string()).collect(),
            NodeSecrets::from_plain(NodeSlot(0), values),
            http,
            limits,
        )
    }

    async fn run(source: &str, scope: &mut ScriptScope, limits: &SandboxLimits) -> Result<Vec<u8>, ScriptError> {
        QuickJsEngine
            .run(CodeLanguage::JavaScript, source, scope, limits)
            .await
    }

    async fn run_plain(source: &str) -> Result<Vec<u8>, ScriptError> {
        let limits = SandboxLimits::default();
        let mut scope = scope_with(&[], &[], http(HttpResponse::ok(json!(null))), &limits);
        run(source, &mut scope, &limits).await
    }

    #[tokio::test]
    async fn test_encoders_match_return_value_encoding() {
        assert_eq!(
            run_plain("return Functions.encodeUint256(7)").await.unwrap(),
            ReturnValue::uint(7).encode()
        );
        assert_eq!(
            run_plain("return Functions.encodeInt256(-42)").await.unwrap(),
            ReturnValue::int(-42).encode()
        );
        assert_eq!(
            run_plain("return Functions.encodeString('héllo')").await.unwrap(),
            "héllo".as_bytes().to_vec()
        );

        let max = run_plain("return Functions.encodeUint256(2n ** 256n - 1n)").await.unwrap();
        assert_eq!(max, vec![0xFF; 32]);
    }

    #[tokio::test]
    async fn test_encoders_reject_out_of_range() {
        let err = run_plain("return Functions.encodeUint256(-1)").await.unwrap_err();
        assert!(err.to_string().contains("out of range"), "{}", err);

        let err = run_plain("return Functions.encodeUint256(2 ** 60)").await.unwrap_err();
        assert!(err.to_string().contains("safe integer"), "{}", err);

        let err = run_plain("return Functions.encodeInt256(2n ** 255n)").await.unwrap_err();
        assert!(err.to_string().contains("out of range"), "{}", err);
    }

    #[tokio::test]
    async fn test_raw_byte_returns() {
        assert_eq!(
            run_plain("return new Uint8Array([1, 2, 255])").await.unwrap(),
            vec![1, 2, 255]
        );
        assert_eq!(run_plain("return new ArrayBuffer(2)").await.unwrap(), vec![0, 0]);

        let err = run_plain("return 42").await.unwrap_err();
        assert!(err.to_string().contains("not an ArrayBuffer or Uint8Array"));
    }

    #[tokio::test]
    async fn test_args_and_secrets_visible() {
        let limits = SandboxLimits::default();
        let mut scope = scope_with(
            &["paris", "lyon"],
            &[("apiKey", "k-1")],
            http(HttpResponse::ok(json!(null))),
            &limits,
        );
        let out = run(
            "return Functions.encodeString(args.join('>') + ':' + secrets.apiKey)",
            &mut scope,
            &limits,
        )
        .await
        .unwrap();
        assert_eq!(out, b"paris>lyon:k-1".to_vec());
    }

    #[tokio::test]
    async fn test_thrown_and_syntax_errors() {
        let err = run_plain("throw Error('boom')").await.unwrap_err();
        assert_eq!(err, ScriptError::Thrown("boom".into()));

        let err = run_plain("return (").await.unwrap_err();
        assert!(err.to_string().starts_with("SyntaxError"), "{}", err);

        let err = run_plain("await new Promise(() => {})").await.unwrap_err();
        assert!(err.to_string().contains("did not finish"));
    }

    #[tokio::test]
    async fn test_http_request_shape() {
        let limits = SandboxLimits::default();
        let transport = http(HttpResponse::ok(json!({ "distance_m": 1234 })));
        let mut scope = scope_with(&[], &[("key", "s3cret")], transport.clone(), &limits);

        let source = r#"
            const response = await Functions.makeHttpRequest({
              url: "https://maps.test/d",
              method: "post",
              params: { origin: "new york", n: 2 },
              headers: { "X-Api-Key": secrets.key },
              data: { mode: "car" },
            })
            if (response.error) throw Error(response.message)
            return Functions.encodeUint256(response.data.distance_m + response.status)
        "#;
        let out = run(source, &mut scope, &limits).await.unwrap();
        assert_eq!(out, ReturnValue::uint(1234 + 200).encode());
        assert_eq!(scope.http_requests(), 1);

        let seen = transport.seen.lock().unwrap();
        assert_eq!(seen[0].url, "https://maps.test/d?origin=new%20york&n=2");
        assert_eq!(seen[0].method, HttpMethod::Post);
        assert_eq!(seen[0].headers.get("X-Api-Key").map(String::as_str), Some("s3cret"));
        assert_eq!(seen[0].data, Some(json!({ "mode": "car" })));
    }

    #[tokio::test]
    async fn test_http_error_status_is_visible_to_script() {
        let limits = SandboxLimits::default();
        let mut scope = scope_with(&[], &[], http(HttpResponse::with_status(503, json!(null))), &limits);
        let source = r#"
            const response = await Functions.makeHttpRequest({ url: "https://x.test/" })
            return Functions.encodeString(`${response.error}|${response.status}|${response.message}`)
        "#;
        let out = run(source, &mut scope, &limits).await.unwrap();
        assert_eq!(out, b"true|503|HTTP status 503".to_vec());
    }

    #[tokio::test]
    async fn test_busy_loop_stops_on_fuel() {
        let limits = SandboxLimits::default().with_max_fuel(5);
        let mut scope = scope_with(&[], &[], http(HttpResponse::ok(json!(null))), &limits);

        let err = run("while (true) {}", &mut scope, &limits).await.unwrap_err();
        assert_eq!(err, ScriptError::Interrupted("compute budget of 5 exhausted".into()));
    }

    #[tokio::test]
    async fn test_busy_loop_stops_at_deadline() {
        let limits = SandboxLimits::default()
            .with_timeout(Duration::from_millis(50))
            .with_max_fuel(u64::MAX);
        let mut scope = scope_with(&[], &[], http(HttpResponse::ok(json!(null))), &limits);

        let started = Instant::now();
        let err = run("for (;;) { try { Math.sqrt(2) } catch (e) {} }", &mut scope, &limits)
            .await
            .unwrap_err();
        assert_eq!(err, ScriptError::Interrupted("exceeded 50ms".into()));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_memory_limit() {
        let limits = SandboxLimits::default().with_max_memory_bytes(8 * 1024 * 1024);
        let mut scope = scope_with(&[], &[], http(HttpResponse::ok(json!(null))), &limits);

        let source = "const hoard = []; for (;;) hoard.push(new Array(100000).fill(1))";
        let err = run(source, &mut scope, &limits).await.unwrap_err();
        assert!(!matches!(err, ScriptError::Interrupted(_)), "{}", err);
    }

    #[tokio::test]
    async fn test_decoded_by_return_type() {
        let bytes = run_plain("return Functions.encodeInt256(-1)").await.unwrap();
        assert_eq!(
            ReturnValue::decode(&bytes, ReturnType::Int256).unwrap(),
            ReturnValue::int(-1)
        );
    }
}
