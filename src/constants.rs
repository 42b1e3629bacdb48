/// Label keys stamped on every resource this controller owns.
pub const LABEL_FUNCTION: &str = "lambda.dev/function";
pub const LABEL_NAMESPACE: &str = "lambda.dev/namespace";
pub const LABEL_FINGERPRINT: &str = "lambda.dev/fingerprint";
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY: &str = "lambda-engine";

/// Annotation keys carrying request correlation across resources.
pub const ANNOTATION_CORRELATION_ID: &str = "lambda.dev/correlation-id";
pub const ANNOTATION_IDEMPOTENCY_KEY: &str = "lambda.dev/idempotency-key";
pub const ANNOTATION_PREVIOUS_IMAGE: &str = "lambda.dev/previous-image";
pub const ANNOTATION_SERVING_SPEC: &str = "lambda.dev/serving-spec";

/// Environment variables injected into build pods, read back by the sidecar.
pub const ENV_CONTEXT_URL: &str = "LAMBDA_CONTEXT_URL";
pub const ENV_TARGET_REGISTRY: &str = "LAMBDA_TARGET_REGISTRY";
pub const ENV_FINGERPRINT: &str = "LAMBDA_FINGERPRINT";
pub const ENV_CORRELATION_ID: &str = "LAMBDA_CORRELATION_ID";
pub const ENV_JOB_NAME: &str = "LAMBDA_JOB_NAME";
pub const ENV_JOB_NAMESPACE: &str = "LAMBDA_JOB_NAMESPACE";
pub const ENV_FUNCTION_NAME: &str = "LAMBDA_FUNCTION_NAME";
pub const ENV_BROKER_URL: &str = "LAMBDA_BROKER_URL";
pub const ENV_POD_NAME: &str = "POD_NAME";

/// Names of the two containers composing a build pod.
pub const BUILDER_CONTAINER_NAME: &str = "builder";
pub const SIDECAR_CONTAINER_NAME: &str = "reporter";

/// Shared-volume contract between builder and sidecar.
pub const WORKSPACE_VOLUME_NAME: &str = "workspace";
pub const WORKSPACE_MOUNT_PATH: &str = "/workspace";
pub const IMAGE_DIGEST_FILE: &str = "/workspace/output/image.txt";

/// Build jobs are garbage-collected by Kubernetes one day after completion.
pub const JOB_TTL_AFTER_FINISHED_SECONDS: i32 = 86_400;

/// CloudEvents type prefixes. Legacy prefixes are accepted on ingress only.
pub const EVENT_TYPE_PREFIX: &str = "io.knative.lambda";
pub const LEGACY_EVENT_TYPE_PREFIXES: [&str; 2] = ["network.notifi.lambda", "lambda"];

/// Source attribute set on every event this controller emits.
pub const EVENT_SOURCE: &str = "lambda-engine";
