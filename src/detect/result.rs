/// One recognised object instance in a frame.
///
/// Coordinates are pixel positions in the frame the detector was given:
/// `(left, top)` is the upper-left corner, `(right, bottom)` the lower-right.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
    pub label: String,
    pub confidence: f32,
}

impl Detection {
    pub fn new(bbox: [f32; 4], label: impl Into<String>, confidence: f32) -> Self {
        Self {
            left: bbox[0],
            top: bbox[1],
            right: bbox[2],
            bottom: bbox[3],
            label: label.into(),
            confidence,
        }
    }

    /// Text drawn above the box, e.g. `person 0.87`.
    pub fn caption(&self) -> String {
        format!("{} {:.2}", self.label, self.confidence)
    }

    pub fn area(&self) -> f32 {
        (self.right - self.left).max(0.0) * (self.bottom - self.top).max(0.0)
    }

    /// Intersection over union with another box.
    pub fn iou(&self, other: &Detection) -> f32 {
        let ix1 = self.left.max(other.left);
        let iy1 = self.top.max(other.top);
        let ix2 = self.right.min(other.right);
        let iy2 = self.bottom.min(other.bottom);
        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

/// Greedy non-maximum suppression, per label, keeping at most `max_detections`.
pub fn non_max_suppression(
    mut dets: Vec<Detection>,
    iou_threshold: f32,
    max_detections: usize,
) -> Vec<Detection> {
    dets.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<Detection> = Vec::with_capacity(dets.len().min(max_detections));
    'outer: for d in dets {
        for k in &keep {
            if k.label == d.label && k.iou(&d) > iou_threshold {
                continue 'outer;
            }
        }
        keep.push(d);
        if keep.len() >= max_detections {
            break;
        }
    }
    keep
}
