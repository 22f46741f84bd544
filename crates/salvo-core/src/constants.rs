//! Well-known paths, image names and build targets shared across the core.

/// Process-scoped temporary root under which source working copies and build
/// caches are created.
pub const SALVO_TMP: &str = "/tmp/salvo";

/// Unix socket created by the docker daemon. In its absence any operation
/// interacting with docker will fail.
pub const DOCKER_SOCKET_PATH: &str = "/var/run/docker.sock";

/// Location inside the benchmark container where user provided tests are
/// mounted. The benchmark discovers all tests in this path and runs them.
pub const LOADGEN_EXTERNAL_TEST_DIR: &str =
    "/usr/local/bin/benchmarks/benchmarks.runfiles/loadgen/benchmarks/external_tests/";

/// Image prefix for release-tagged proxy builds.
pub const PROXY_IMAGE_RELEASE_PREFIX: &str = "salvoproxy/proxy";

/// Image prefix for development (commit hash) proxy builds.
pub const PROXY_IMAGE_DEV_PREFIX: &str = "salvoproxy/proxy-dev";

/// Names under which the load-generator image scripts tag their output;
/// used when the job control names a load-generator source but no images.
pub const LOADGEN_BENCHMARK_IMAGE_DEFAULT: &str = "salvoloadgen/benchmark-dev:latest";
pub const LOADGEN_BINARY_IMAGE_DEFAULT: &str = "salvoloadgen/loadgen-dev:latest";

/// Default remote for the proxy-under-test when the job control names the
/// identity but no source location.
pub const DEFAULT_PROXY_REMOTE: &str = "https://github.com/envoyproxy/envoy.git";

/// Committer identity used to filter release-automation commits when walking
/// history. Overridable per source tree.
pub const DEFAULT_COMMITTER_FILTER: &str = "GitHub <noreply@github.com>";

/// Directories probed for a clang toolchain, in order.
pub const TOOLCHAIN_PROBE_PATHS: &[&str] = &["/opt/llvm/bin", "/usr/bin"];

/// Bazel target producing the static proxy binary.
pub const PROXY_BUILD_TARGET: &str = "//source/exe:proxy-static";

/// Where bazel leaves the proxy binary relative to the source root.
pub const PROXY_BINARY_PATH: &str = "bazel-bin/source/exe/proxy-static";

/// Staging directory for the proxy binary before the image build.
pub const PROXY_STAGING_DIR: &str = "build_release";

/// Dockerfile used to build the proxy image.
pub const PROXY_DOCKERFILE: &str = "ci/Dockerfile-proxy";

/// Bazel target for the load-generator benchmark driver.
pub const LOADGEN_BENCHMARK_TARGET: &str = "//benchmarks:benchmarks";

/// Bazel targets for the load-generator client and server binaries.
pub const LOADGEN_BINARY_TARGETS: &str = "//:loadgen-client //:loadgen-server";

/// Script in the load-generator source tree building its benchmark image.
pub const LOADGEN_BENCHMARK_IMAGE_SCRIPT: &str = "ci/docker/benchmark_build.sh";

/// Script in the load-generator source tree building its binary image.
pub const LOADGEN_BINARY_IMAGE_SCRIPT: &str = "ci/docker/docker_build.sh";

/// Test target pattern run by the binary benchmark's test runner.
pub const LOADGEN_TEST_TARGETS: &str = "//benchmarks:*";

/// Path of the benchmark driver binary relative to the load-generator source
/// root, once `LOADGEN_BENCHMARK_TARGET` has been built.
pub const LOADGEN_BENCHMARK_BINARY: &str = "bazel-bin/benchmarks/benchmarks";

/// Command line executed inside the benchmark image and by the scavenging
/// benchmark driver.
pub const BENCHMARK_COMMAND_ARGS: &str = "--log-cli-level=info -vvvv";

/// Substring of the load-generator's HTTP client identifier. Its presence in
/// the combined container output is the success marker for a dockerized run.
pub const BENCHMARK_SUCCESS_MARKER: &str = "loadgen-client";

/// Environment variables that leak from the host and confuse nested build
/// tools; a scope saves and unsets them on entry, restores them on exit.
pub const POISON_VARS: &[&str] = &[
    "HEAPPROFILE",
    "HEAPCHECK",
    "TMPDIR",
    "PYTHONPATH",
    "RUNFILES_DIR",
    "RUNFILES_MANIFEST_FILE",
];
