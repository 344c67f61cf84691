// dash_share - Shareable view-state links for weather dashboards
//
// Copyright 2022 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

//! Shareable view-state links for weather dashboards
//!
//! ## Features
//!
//! `dash_share` lets a weather dashboard offer "share this view" links. The dashboard posts
//! its current UI state (station, date range, selected tab, selected variables, etc.) as a
//! JSON object and gets back a short token and a link of the form
//! `https://dashboard.example/?state=$TOKEN`. When somebody opens that link, the dashboard
//! asks `dash_share` to resolve the token and renders the saved view.
//!
//! Tokens come from URLs that anybody can edit, so they are checked against a strict
//! allow-list (`[A-Za-z0-9-]`, at most 64 characters) before they are used to look anything
//! up. Unknown, malformed, or corrupt tokens always fall back to the dashboard's default view.
//!
//! ## Build
//!
//! `dash_share` is a Rust program and must be built from source using a
//! [Rust toolchain](https://rustup.rs/).
//!
//! ```text
//! git clone git@github.com:56quarters/dash_share.git && cd dash_share
//! cargo build --release
//! ```
//!
//! ## Usage
//!
//! ### Run
//!
//! Shared views are stored as one JSON file per view in a directory that you pick.
//!
//! ```text
//! ./dash_share --storage-dir /var/lib/dash_share --public-url https://weather.example/
//! ```
//!
//! ### Endpoints
//!
//! * `POST /share` - Save the JSON object in the request body, returns `{"token": ..., "url": ...}`.
//! * `GET /share/$TOKEN` - Return a saved view, or `404` if there isn't one.
//! * `GET /view?state=$TOKEN` - Return the view to render for a page load: the saved view,
//!   or the default view if the `state` parameter is missing or can't be resolved.
//! * `GET /metrics` - Prometheus metrics.
//!
//! ### Prometheus
//!
//! The following metrics are exposed on `/metrics`.
//!
//! * `dash_share_saves_total{outcome=$OUTCOME}` - Shared views saved, by outcome.
//! * `dash_share_loads_total{outcome=$OUTCOME}` - Shared view lookups, by outcome.
//!

pub mod backend;
pub mod http;
pub mod metrics;
pub mod snapshot;
pub mod store;
pub mod token;
