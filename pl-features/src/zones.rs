//! Virtual-checkpoint ("zone") bookkeeping along a fixed centerline.

/// Tracks which zone the car is in and when each zone was entered.
///
/// The car moves from zone `k` to `k + 1` once it is closer to center `k + 1`
/// than to center `k`. Zones are only ever entered in order.
#[derive(Debug, Clone)]
pub struct ZoneTracker {
    centers: Vec<[f32; 3]>,
    current: usize,
    entrance_times_ms: Vec<i32>,
}

fn dist2(a: &[f32; 3], b: &[f32; 3]) -> f32 {
    let dx = a[0] - b[0];
    let dy = a[1] - b[1];
    let dz = a[2] - b[2];
    dx * dx + dy * dy + dz * dz
}

impl ZoneTracker {
    pub fn new(centers: Vec<[f32; 3]>) -> Self {
        Self {
            centers,
            current: 0,
            entrance_times_ms: vec![0],
        }
    }

    pub fn reset(&mut self, start_time_ms: i32) {
        self.current = 0;
        self.entrance_times_ms.clear();
        self.entrance_times_ms.push(start_time_ms);
    }

    /// Advance with the car's position; returns how many zones were entered.
    pub fn update(&mut self, position: &[f32; 3], race_time_ms: i32) -> usize {
        let mut entered = 0;
        while self.current + 1 < self.centers.len()
            && dist2(position, &self.centers[self.current + 1])
                < dist2(position, &self.centers[self.current])
        {
            self.current += 1;
            self.entrance_times_ms.push(race_time_ms);
            entered += 1;
        }
        entered
    }

    pub fn current_zone(&self) -> usize {
        self.current
    }

    pub fn zone_count(&self) -> usize {
        self.centers.len()
    }

    pub fn entrance_times_ms(&self) -> &[i32] {
        &self.entrance_times_ms
    }

    pub fn last_entrance_ms(&self) -> i32 {
        self.entrance_times_ms.last().copied().unwrap_or(0)
    }

    /// `k` centers starting with the next zone, repeating the final center
    /// past the end. Empty when there are no centers.
    pub fn upcoming(&self, k: usize) -> impl Iterator<Item = &[f32; 3]> + '_ {
        let last = self.centers.len().saturating_sub(1);
        let start = self.current + 1;
        let n = if self.centers.is_empty() { 0 } else { k };
        (0..n).map(move |i| &self.centers[(start + i).min(last)])
    }
}
