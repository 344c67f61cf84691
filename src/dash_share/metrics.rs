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

use crate::store::{LoadError, RestoreStatus, SaveError};
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum SaveOutcome {
    Saved,
    CollisionsExhausted,
    BackendError,
    EncodeError,
}

impl From<&SaveError> for SaveOutcome {
    fn from(e: &SaveError) -> Self {
        match e {
            SaveError::Encode(_) => SaveOutcome::EncodeError,
            SaveError::Backend(_) => SaveOutcome::BackendError,
            SaveError::RetriesExhausted(_) => SaveOutcome::CollisionsExhausted,
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum LoadOutcome {
    Restored,
    Default,
    InvalidToken,
    NotFound,
    CorruptRecord,
    BackendError,
}

impl From<&LoadError> for LoadOutcome {
    fn from(e: &LoadError) -> Self {
        match e {
            LoadError::InvalidToken(_) => LoadOutcome::InvalidToken,
            LoadError::NotFound(_) => LoadOutcome::NotFound,
            LoadError::CorruptRecord(_, _) => LoadOutcome::CorruptRecord,
            LoadError::Backend(_, _) => LoadOutcome::BackendError,
        }
    }
}

impl From<&RestoreStatus> for LoadOutcome {
    fn from(status: &RestoreStatus) -> Self {
        match status {
            RestoreStatus::Default => LoadOutcome::Default,
            RestoreStatus::Restored(_) => LoadOutcome::Restored,
            RestoreStatus::Fallback(e) => LoadOutcome::from(e),
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct SaveLabels {
    outcome: SaveOutcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct LoadLabels {
    outcome: LoadOutcome,
}

/// Counters for share and restore requests.
///
/// All metrics are created and registered upon call to `ShareMetrics::new()` and share
/// the prefix "dash_share_".
#[derive(Debug, Clone, Default)]
pub struct ShareMetrics {
    saves: Family<SaveLabels, Counter>,
    loads: Family<LoadLabels, Counter>,
}

impl ShareMetrics {
    pub fn new(reg: &mut Registry) -> Self {
        let saves = Family::<SaveLabels, Counter>::default();
        let loads = Family::<LoadLabels, Counter>::default();

        reg.register("dash_share_saves", "Shared views saved, by outcome", saves.clone());
        reg.register("dash_share_loads", "Shared view lookups, by outcome", loads.clone());

        Self { saves, loads }
    }

    pub fn save(&self, outcome: SaveOutcome) {
        self.saves.get_or_create(&SaveLabels { outcome }).inc();
    }

    pub fn load(&self, outcome: LoadOutcome) {
        self.loads.get_or_create(&LoadLabels { outcome }).inc();
    }
}
