//! Wrapper sources injected next to the user code. The table is a closed set
//! keyed by runtime language; adding a runtime is a data change here, nothing
//! else in the crate grows a branch for it.

use once_cell::sync::Lazy;
use tera::{Context, Tera};

use crate::io_models::{RuntimeKind, RuntimeSpec};

use super::BuildContextError;

const PYTHON_DOCKERFILE: &str = r#"FROM python:{{ version }}-slim
WORKDIR /app
COPY . .
RUN if [ -f requirements.txt ]; then pip install --no-cache-dir -r requirements.txt; fi
ENV LAMBDA_HANDLER={{ handler }}
ENTRYPOINT ["python", "/app/.lambda/bootstrap.py"]
"#;

const PYTHON_BOOTSTRAP: &str = r#"import importlib
import json
import os
from http.server import BaseHTTPRequestHandler, HTTPServer

module_name, function_name = os.environ["LAMBDA_HANDLER"].rsplit(".", 1)
handler = getattr(importlib.import_module(module_name), function_name)


class Invoker(BaseHTTPRequestHandler):
    def do_POST(self):
        length = int(self.headers.get("content-length", 0))
        event = json.loads(self.rfile.read(length) or b"{}")
        body = json.dumps(handler(event)).encode()
        self.send_response(200)
        self.send_header("content-type", "application/json")
        self.end_headers()
        self.wfile.write(body)

    def do_GET(self):
        self.send_response(200)
        self.end_headers()


HTTPServer(("", int(os.environ.get("PORT", "8080"))), Invoker).serve_forever()
"#;

const NODE_DOCKERFILE: &str = r#"FROM node:{{ version }}-slim
WORKDIR /app
COPY . .
RUN if [ -f package.json ]; then npm install --omit=dev; fi
ENV LAMBDA_HANDLER={{ handler }}
ENTRYPOINT ["node", "/app/.lambda/bootstrap.js"]
"#;

const NODE_BOOTSTRAP: &str = r#"const http = require("http");
const path = require("path");

const [moduleName, functionName] = process.env.LAMBDA_HANDLER.split(/\.(?=[^.]+$)/);
const handler = require(path.resolve(moduleName))[functionName];

http
  .createServer((req, res) => {
    if (req.method !== "POST") {
      res.writeHead(200);
      return res.end();
    }
    let body = "";
    req.on("data", (chunk) => (body += chunk));
    req.on("end", async () => {
      const result = await handler(body ? JSON.parse(body) : {});
      res.writeHead(200, { "content-type": "application/json" });
      res.end(JSON.stringify(result));
    });
  })
  .listen(process.env.PORT || 8080);
"#;

const GO_DOCKERFILE: &str = r#"FROM golang:{{ version }} AS build
WORKDIR /app
COPY . .
RUN go build -o /bin/function ./.lambda

FROM gcr.io/distroless/base-debian12
COPY --from=build /bin/function /bin/function
ENV LAMBDA_HANDLER={{ handler }}
ENTRYPOINT ["/bin/function"]
"#;

const GO_BOOTSTRAP: &str = r#"package main

import (
	"encoding/json"
	"net/http"
	"os"

	handler "app/handler"
)

func main() {
	http.HandleFunc("/", func(w http.ResponseWriter, r *http.Request) {
		if r.Method != http.MethodPost {
			w.WriteHeader(http.StatusOK)
			return
		}
		var event map[string]any
		_ = json.NewDecoder(r.Body).Decode(&event)
		w.Header().Set("content-type", "application/json")
		_ = json.NewEncoder(w).Encode(handler.Handle(event))
	})
	port := os.Getenv("PORT")
	if port == "" {
		port = "8080"
	}
	_ = http.ListenAndServe(":"+port, nil)
}
"#;

static TEMPLATES: Lazy<Tera> = Lazy::new(|| {
    let mut tera = Tera::default();
    tera.add_raw_templates(vec![
        ("python.dockerfile", PYTHON_DOCKERFILE),
        ("python.bootstrap", PYTHON_BOOTSTRAP),
        ("node.dockerfile", NODE_DOCKERFILE),
        ("node.bootstrap", NODE_BOOTSTRAP),
        ("go.dockerfile", GO_DOCKERFILE),
        ("go.bootstrap", GO_BOOTSTRAP),
    ])
    .expect("wrapper templates are static and must parse");
    tera
});

fn bootstrap_file_name(runtime: RuntimeKind) -> &'static str {
    match runtime {
        RuntimeKind::Python => ".lambda/bootstrap.py",
        RuntimeKind::Node => ".lambda/bootstrap.js",
        RuntimeKind::Go => ".lambda/main.go",
    }
}

/// Renders the wrapper descriptor for a runtime: the Dockerfile plus the
/// bootstrap source, as (relative path, content) pairs ready for the archive.
pub fn render_wrapper(runtime: &RuntimeSpec, handler: &str) -> Result<Vec<(String, String)>, BuildContextError> {
    let mut context = Context::new();
    context.insert("version", &runtime.version);
    context.insert("handler", handler);

    let language = runtime.language.as_str();
    let render = |template: &str| {
        TEMPLATES
            .render(template, &context)
            .map_err(|err| BuildContextError::TemplateMissing {
                runtime: runtime.to_string(),
                raw_error_message: err.to_string(),
            })
    };

    Ok(vec![
        ("Dockerfile".to_string(), render(&format!("{language}.dockerfile"))?),
        (
            bootstrap_file_name(runtime.language).to_string(),
            render(&format!("{language}.bootstrap"))?,
        ),
    ])
}
