pub fn generate_starter_config() -> String {
    r#"# =============================================================================
# EDGE AGENT CONFIGURATION
# =============================================================================
# This file configures CAN capture, batching, the offline buffer and uploads.
#
# Values of the form $env{...} are replaced from the environment before parsing.
# Durations accept human strings: 500ms, 60s, 5m, 1h.
#
# Config file locations (in order of precedence):
#   1. Path specified via --config argument
#   2. ~/.config/edge-agent/config.yml
#   3. /etc/edge-agent/config.yml

# Identifier attached to every frame and used as the partition directory.
# Defaults to the host name when omitted.
vehicle_id: vehicle-001

# Root of the on-disk queue: pending/, archive/, failed/ and staging/ live here.
data_dir: /var/lib/edge-agent

# =============================================================================
# CAN BUS
# =============================================================================

can:
  interface: can0
  # Informational; the netdev bitrate is set with `ip link`
  bitrate: 500000
  fd: false
  # Bounded read so shutdown is observed promptly
  read_timeout: 100ms
  # Hardware acceptance filters, re-applied on every reconnect.
  # A frame passes when frame_id & mask == id & mask.
  filters: []
  #   - id: 0x0C0
  #     mask: 0x7F0
  #     extended: false
  # Reconnect schedule after bus-off or device loss (retried forever)
  reconnect:
    initial: 1s
    max: 30s

# =============================================================================
# SIMULATION (used by `edge-agent run --simulate`)
# =============================================================================

simulation:
  frame_rate_hz: 1000
  # Same seed reproduces the exact frame payload sequence
  seed: 42
  # Stop after this long; runs forever when omitted
  # duration: 10m
  cycle:
    - phase: idle
      duration: 30s
    - phase: acceleration
      duration: 60s
    - phase: cruise
      duration: 240s
    - phase: deceleration
      duration: 60s

# =============================================================================
# BATCHING
# =============================================================================

batch:
  # A batch seals when its window elapses or it reaches max_frames
  window: 60s
  max_frames: 100000
  # zstd | snappy | none
  compression: zstd
  zstd_level: 3

# =============================================================================
# OFFLINE BUFFER
# =============================================================================

buffer:
  # Hard cap on pending + failed bytes; the oldest file is evicted beyond it
  max_disk_mb: 5000
  # Also evict the oldest file beyond this many queued files (unbounded when omitted)
  # max_files: 1000
  # archive: keep uploaded files under archive/   delete: remove them
  retention: archive
  # Prune oldest archived files beyond this size (unbounded when omitted)
  # archive_max_mb: 2000

# =============================================================================
# UPLOAD
# =============================================================================

upload:
  enabled: true
  workers: 2
  prefix: raw
  store:
    type: s3
    bucket: $env{EDGE_AGENT_BUCKET}
    region: us-east-1
    # endpoint_url: http://minio.local:9000
  # Bench setups can write to a directory instead:
  # store:
  #   type: local
  #   path: /srv/can-outbox
  backoff:
    initial: 2s
    max: 300s
  # Files are marked failed once this many retries are exhausted
  max_attempts: 5
  request_timeout: 60s
  poll_interval: 1s

# =============================================================================
# HEALTH
# =============================================================================

health:
  interval: 60s
  fps_window: 10s

# =============================================================================
# LOGGING
# =============================================================================
# Logs always go to stderr (filter with RUST_LOG). Set dir to also write
# daily-rolling JSON logs.

logging: {}
#  dir: /var/log/edge-agent
"#
    .to_string()
}
