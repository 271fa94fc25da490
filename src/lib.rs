//! Deploy a small monitoring stack to AWS.
//!
//! A single `create` run provisions a VPC with one public subnet, two
//! generated secrets in Secrets Manager, an IAM instance role, one EC2
//! instance bootstrapped (via user data) into a BugSink + Uptime Kuma +
//! Caddy compose stack, an Elastic IP, and two Route 53 A records pointing
//! the configured subdomains at that address. `destroy` tears everything
//! down again by tag; `list` shows active stacks.
//!
//! Resource creation is idempotent: every resource is looked up by its
//! `stack` tag (or stack-derived name) before it is created, and DNS
//! records are written with UPSERT, so re-running `create` with unchanged
//! configuration produces no changes.

pub mod aws;
